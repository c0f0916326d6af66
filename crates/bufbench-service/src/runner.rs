//! Workload generator process supervision.
//!
//! The runner owns the generator child process for one test case: it
//! streams progress lines into metric samples, tags each with the phase it
//! fell into, and guarantees the process (and anything it spawned) is gone
//! before `run` returns.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use bufbench_core::{
    phase_at, BenchError, BenchResult, MetricSample, Phase, ProgressLine, RecordSink, TestCase,
};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Split};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::ControllerStatus;

/// How long output already written by an exited generator is still read.
const EXITED_OUTPUT_WAIT: Duration = Duration::from_millis(200);

/// Which output stream of the generator carries progress lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStream {
    Stdout,
    Stderr,
}

/// Fully built generator invocation.
#[derive(Debug, Clone)]
pub struct WorkloadCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub progress: ProgressStream,
}

/// Builds the generator command line for a test case.
pub trait WorkloadLauncher: Send + Sync {
    /// Command that runs `test_case` for at least `duration`.
    fn command(&self, test_case: &TestCase, duration: Duration) -> WorkloadCommand;
}

/// Timings the runner follows.
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    /// Samples before this elapsed time are tagged warmup.
    pub warmup: Duration,
    /// Hard limit on how long the generator may run.
    pub budget: Duration,
    /// How long a stopped generator gets to exit before it is killed.
    pub terminate_grace: Duration,
}

/// Why the runner stopped the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStop {
    /// Stopped on request, normally because the capacity sequence finished.
    Requested,
    /// The budget ran out first.
    BudgetElapsed,
}

/// Summary of one generator run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerReport {
    pub stop: RunnerStop,
    pub elapsed: Duration,
    pub warmup_samples: usize,
    pub measurement_samples: usize,
    /// Progress lines that could not be parsed.
    pub skipped_lines: usize,
    /// Times the generator was started again after exiting during a resize.
    pub relaunches: usize,
}

impl RunnerReport {
    #[must_use]
    pub fn samples(&self) -> usize {
        self.warmup_samples + self.measurement_samples
    }
}

/// Lifecycle hooks for work that must stay inside the generator's lifetime.
#[derive(Debug, Default)]
pub struct RunnerSignals {
    /// Fired once the first generator process is running.
    pub started: Option<oneshot::Sender<()>>,
    /// Cancelled when the runner stops recording, before the generator is
    /// torn down.
    pub stopping: CancellationToken,
}

/// Runs the workload generator for one test case.
pub struct WorkloadRunner {
    launcher: Arc<dyn WorkloadLauncher>,
    settings: RunnerSettings,
    resizes: Option<watch::Receiver<ControllerStatus>>,
}

impl WorkloadRunner {
    #[must_use]
    pub fn new(launcher: Arc<dyn WorkloadLauncher>, settings: RunnerSettings) -> Self {
        Self {
            launcher,
            settings,
            resizes: None,
        }
    }

    /// Starts the generator again when it exits while `status` shows a
    /// resize in flight, as soon as that resize is over.
    ///
    /// A server restart ends every generator connection; the run carries on
    /// with the same clock and the same budget.
    #[must_use]
    pub fn relaunch_across_resizes(mut self, status: watch::Receiver<ControllerStatus>) -> Self {
        self.resizes = Some(status);
        self
    }

    /// Starts the generator and records its progress until the budget
    /// elapses or `cancel` fires.
    ///
    /// Returns [`BenchError::WorkloadExited`] if the generator ends on its
    /// own before either happens. The process is reaped in every case.
    pub async fn run(
        &self,
        test_case: &TestCase,
        sink: Box<dyn RecordSink<MetricSample>>,
        cancel: CancellationToken,
    ) -> BenchResult<RunnerReport> {
        self.run_signalled(test_case, sink, cancel, RunnerSignals::default())
            .await
    }

    /// [`run`](Self::run), reporting start and stop through `signals`.
    pub async fn run_signalled(
        &self,
        test_case: &TestCase,
        mut sink: Box<dyn RecordSink<MetricSample>>,
        cancel: CancellationToken,
        mut signals: RunnerSignals,
    ) -> BenchResult<RunnerReport> {
        let deadline = tokio::time::sleep(self.settings.budget);
        tokio::pin!(deadline);

        let mut recorder = Recorder {
            test_case,
            warmup: self.settings.warmup,
            started: Instant::now(),
            sink: sink.as_mut(),
            report: RunnerReport {
                stop: RunnerStop::Requested,
                elapsed: Duration::ZERO,
                warmup_samples: 0,
                measurement_samples: 0,
                skipped_lines: 0,
                relaunches: 0,
            },
        };

        let result = loop {
            let remaining = self
                .settings
                .budget
                .saturating_sub(recorder.started.elapsed());
            let mut generator = match self.launch(test_case, remaining).await {
                Ok(generator) => generator,
                Err(e) => break Err(e),
            };
            if let Some(started) = signals.started.take() {
                // nobody waiting is fine
                let _ = started.send(());
            }

            let status = match follow(&mut generator, &mut recorder, &mut deadline, &cancel).await {
                Ended::Stopped(stop) => {
                    signals.stopping.cancel();
                    generator.shutdown(self.settings.terminate_grace).await;
                    break Ok(stop);
                }
                Ended::Exited(status) => status,
            };
            generator.shutdown(self.settings.terminate_grace).await;

            match self.wait_out_resize(&cancel, &mut deadline).await {
                Resume::Relaunch => {
                    recorder.report.relaunches += 1;
                    info!(
                        relaunches = recorder.report.relaunches,
                        exit = %status,
                        elapsed_secs = recorder.started.elapsed().as_secs_f64(),
                        "relaunching workload generator after resize"
                    );
                }
                Resume::Stop(stop) => break Ok(stop),
                Resume::Unexplained => {
                    break Err(BenchError::WorkloadExited {
                        test_case: test_case.kind,
                        elapsed: recorder.started.elapsed(),
                        status,
                    })
                }
            }
        };
        signals.stopping.cancel();

        if let Err(e) = recorder.sink.flush() {
            warn!(error = %e, "failed to flush metric stream");
        }
        let mut report = recorder.report;
        report.elapsed = recorder.started.elapsed();
        match result {
            Ok(stop) => {
                report.stop = stop;
                info!(
                    stop = ?report.stop,
                    elapsed_secs = report.elapsed.as_secs_f64(),
                    warmup_samples = report.warmup_samples,
                    measurement_samples = report.measurement_samples,
                    skipped_lines = report.skipped_lines,
                    relaunches = report.relaunches,
                    "workload generator stopped"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, samples = report.samples(), "workload generator ended early");
                Err(e)
            }
        }
    }

    async fn launch(&self, test_case: &TestCase, duration: Duration) -> BenchResult<Generator> {
        let command = self.launcher.command(test_case, duration);
        let mut child = spawn(&command)?;
        let group = child.id();

        info!(
            program = %command.program.display(),
            args = ?command.args,
            pid = group,
            duration_secs = duration.as_secs(),
            "workload generator started"
        );

        match split_output(&mut child, command.progress) {
            Ok((progress, chatter)) => Ok(Generator {
                child,
                group,
                lines: BufReader::new(progress).split(b'\n'),
                drain: tokio::spawn(drain_lines(chatter)),
            }),
            Err(e) => {
                terminate(&mut child, group, self.settings.terminate_grace).await;
                Err(e)
            }
        }
    }

    /// Decides what follows a generator exit: wait for the resize that
    /// caused it and relaunch, or treat it as a crash.
    async fn wait_out_resize(
        &self,
        cancel: &CancellationToken,
        deadline: &mut Pin<&mut Sleep>,
    ) -> Resume {
        let Some(status) = &self.resizes else {
            return Resume::Unexplained;
        };
        let mut status = status.clone();
        let target_gb = {
            let current = status.borrow_and_update();
            if !current.resizing {
                return Resume::Unexplained;
            }
            current.target_gb
        };
        info!(target_gb = ?target_gb, "generator exited during a resize, waiting for it to finish");

        tokio::select! {
            biased;
            () = cancel.cancelled() => Resume::Stop(RunnerStop::Requested),
            () = deadline.as_mut() => Resume::Stop(RunnerStop::BudgetElapsed),
            finished = status.wait_for(|s| !s.resizing) => {
                if finished.is_ok() {
                    Resume::Relaunch
                } else {
                    Resume::Unexplained
                }
            }
        }
    }
}

/// One generator process and its output.
struct Generator {
    child: Child,
    /// Process group id, kept after the child is reaped.
    group: Option<u32>,
    lines: Split<BufReader<BoxedOutput>>,
    drain: JoinHandle<()>,
}

impl Generator {
    async fn shutdown(mut self, grace: Duration) {
        terminate(&mut self.child, self.group, grace).await;
        self.drain.abort();
    }
}

enum Ended {
    Stopped(RunnerStop),
    /// The generator exited on its own; carries how.
    Exited(String),
}

enum Resume {
    Relaunch,
    Stop(RunnerStop),
    Unexplained,
}

/// Turns progress lines into samples. Elapsed time is measured from the
/// first launch, across relaunches.
struct Recorder<'a> {
    test_case: &'a TestCase,
    warmup: Duration,
    started: Instant,
    sink: &'a mut dyn RecordSink<MetricSample>,
    report: RunnerReport,
}

impl Recorder<'_> {
    fn record(&mut self, line: &str) {
        let line = line.trim_end();
        if !line.contains("progress:") {
            if !line.is_empty() {
                debug!(line, "generator output");
            }
            return;
        }

        let progress = match ProgressLine::parse(line) {
            Ok(progress) => progress,
            Err(e) => {
                self.report.skipped_lines += 1;
                warn!(error = %e, "skipping progress line");
                return;
            }
        };

        let elapsed = self.started.elapsed();
        let phase = phase_at(elapsed, self.warmup);
        let sample = MetricSample {
            timestamp: Utc::now(),
            test_case: self.test_case.kind,
            phase,
            elapsed_seconds: elapsed.as_secs_f64(),
            tps: progress.tps,
            latency_avg_ms: progress.latency_avg_ms,
            latency_stddev_ms: progress.latency_stddev_ms,
        };
        debug!(
            generator_elapsed = progress.elapsed_seconds,
            elapsed = sample.elapsed_seconds,
            phase = phase.as_str(),
            tps = sample.tps,
            "progress"
        );

        match self.sink.append(&sample) {
            Ok(()) => match phase {
                Phase::Warmup => self.report.warmup_samples += 1,
                Phase::Measurement => self.report.measurement_samples += 1,
            },
            Err(e) => warn!(error = %e, "failed to write metric sample"),
        }
    }
}

/// Records progress until the run is stopped or the generator exits.
///
/// Exit is noticed either by end of output or by the process itself
/// finishing, whichever comes first; a descendant holding the output open
/// does not hide a crash.
async fn follow(
    generator: &mut Generator,
    recorder: &mut Recorder<'_>,
    deadline: &mut Pin<&mut Sleep>,
    cancel: &CancellationToken,
) -> Ended {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ended::Stopped(RunnerStop::Requested),
            () = deadline.as_mut() => return Ended::Stopped(RunnerStop::BudgetElapsed),
            segment = generator.lines.next_segment() => match segment {
                Ok(Some(bytes)) => recorder.record(&String::from_utf8_lossy(&bytes)),
                Ok(None) => return Ended::Exited(wait_briefly(&mut generator.child).await),
                Err(e) => {
                    warn!(error = %e, "failed to read generator output");
                    let status = wait_briefly(&mut generator.child).await;
                    return Ended::Exited(format!("{status} (output error: {e})"));
                }
            },
            status = generator.child.wait() => {
                let until = Instant::now() + EXITED_OUTPUT_WAIT;
                while let Ok(Ok(Some(bytes))) = timeout_at(until, generator.lines.next_segment()).await {
                    recorder.record(&String::from_utf8_lossy(&bytes));
                }
                return Ended::Exited(match status {
                    Ok(status) => describe(status),
                    Err(e) => format!("wait failed: {e}"),
                });
            }
        }
    }
}

type BoxedOutput = Box<dyn AsyncRead + Unpin + Send>;

fn spawn(command: &WorkloadCommand) -> BenchResult<Child> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // own process group, so stopping it also stops whatever it forked
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn().map_err(|source| BenchError::WorkloadSpawn {
        program: command.program.display().to_string(),
        source,
    })
}

/// Returns the progress stream and the other stream.
fn split_output(child: &mut Child, progress: ProgressStream) -> BenchResult<(BoxedOutput, BoxedOutput)> {
    let stdout: BoxedOutput = Box::new(
        child
            .stdout
            .take()
            .ok_or_else(|| BenchError::Internal("generator stdout not captured".to_string()))?,
    );
    let stderr: BoxedOutput = Box::new(
        child
            .stderr
            .take()
            .ok_or_else(|| BenchError::Internal("generator stderr not captured".to_string()))?,
    );

    Ok(match progress {
        ProgressStream::Stdout => (stdout, stderr),
        ProgressStream::Stderr => (stderr, stdout),
    })
}

async fn drain_lines(output: BoxedOutput) {
    let mut lines = BufReader::new(output).split(b'\n');
    while let Ok(Some(bytes)) = lines.next_segment().await {
        debug!(line = %String::from_utf8_lossy(&bytes).trim_end(), "generator output");
    }
}

/// Describes how the generator exited after closing its output.
async fn wait_briefly(child: &mut Child) -> String {
    match timeout(Duration::from_secs(1), child.wait()).await {
        Ok(Ok(status)) => describe(status),
        Ok(Err(e)) => format!("wait failed: {e}"),
        Err(_) => "output closed while still running".to_string(),
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => format!("terminated ({status})"),
    }
}

/// Stops the generator: SIGTERM to its process group, then SIGKILL after
/// `grace`. Always reaps the child.
async fn terminate(child: &mut Child, group: Option<u32>, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(status = %describe(status), "generator already exited");
        signal_group(child, group, Signal::Kill);
        return;
    }

    signal_group(child, group, Signal::Term);
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(status = %describe(status), "generator exited");
            // stragglers in the group
            signal_group(child, group, Signal::Kill);
            return;
        }
        Ok(Err(e)) => warn!(error = %e, "failed waiting for generator"),
        Err(_) => warn!(grace_secs = grace.as_secs_f64(), "generator ignored SIGTERM, killing"),
    }

    signal_group(child, group, Signal::Kill);
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill generator");
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(_child: &mut Child, group: Option<u32>, signal: Signal) {
    let Some(Ok(pgid)) = group.map(libc::pid_t::try_from) else {
        return;
    };
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the group created at spawn.
    if unsafe { libc::kill(-pgid, signal) } != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the whole group is already gone
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(error = %err, pgid, "failed to signal generator process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _group: Option<u32>, signal: Signal) {
    if matches!(signal, Signal::Kill) {
        if let Err(e) = child.start_kill() {
            warn!(error = %e, "failed to kill generator");
        }
    }
}
