//! Workload runner behaviour against real child processes.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bufbench_core::{BenchError, Phase, TestCase, TestCaseKind, WorkloadSettings};
use bufbench_service::{
    MemoryOutput, OutputStreams, ProgressStream, RunnerSettings, RunnerStop, WorkloadRunner,
};
use common::*;
use tokio_util::sync::CancellationToken;

fn runner(launcher: ShellLauncher, warmup: f64, budget: f64) -> WorkloadRunner {
    WorkloadRunner::new(
        Arc::new(launcher),
        RunnerSettings {
            warmup: secs(warmup),
            budget: secs(budget),
            terminate_grace: secs(1.0),
        },
    )
}

fn test_case() -> TestCase {
    TestCase::resolve(TestCaseKind::ReadOnlyFullyCached, &WorkloadSettings::default())
}

#[tokio::test]
async fn test_ten_lines_split_three_warmup_seven_measurement() {
    let script = r#"i=1
while [ $i -le 10 ]; do
  echo "progress: $i.0 s, 900.0 tps, lat 2.000 ms stddev 0.500" >&2
  i=$((i+1))
  [ $i -le 10 ] && sleep 1
done
sleep 60"#;
    let runner = runner(ShellLauncher::stderr(script), 3.0, 10.5);
    let output = MemoryOutput::new();

    let report = runner
        .run(&test_case(), output.metric_sink().unwrap(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.stop, RunnerStop::BudgetElapsed);
    assert_eq!(report.warmup_samples, 3);
    assert_eq!(report.measurement_samples, 7);

    let phases: Vec<Phase> = output.metrics.lock().iter().map(|s| s.phase).collect();
    assert_eq!(&phases[..3], &[Phase::Warmup; 3]);
    assert!(phases[3..].iter().all(|p| *p == Phase::Measurement));
}

#[tokio::test]
async fn test_malformed_line_skipped_between_valid_ones() {
    let script = r#"echo "progress: 1.0 s, 100.0 tps, lat 1.0 ms stddev 0.1" >&2
echo "progress: 2.0 s, 110.0 tps, lat 1.1 ms stddev 0.1" >&2
echo "progress: 3.0 s, ??? tps, lat 1.2 ms stddev 0.1" >&2
echo "progress: 4.0 s, 130.0 tps, lat 1.3 ms stddev 0.1" >&2
echo "progress: 5.0 s, 140.0 tps, lat" >&2
echo "progress: 6.0 s, 150.0 tps, lat 1.5 ms stddev 0.1, 0 failed" >&2
sleep 60"#;
    let runner = runner(ShellLauncher::stderr(script), 0.0, 1.5);
    let output = MemoryOutput::new();

    let report = runner
        .run(&test_case(), output.metric_sink().unwrap(), CancellationToken::new())
        .await
        .unwrap();

    let samples = output.metrics.lock().clone();
    assert_eq!(report.skipped_lines, 2);
    assert_eq!(samples.len(), 6 - 2);
    assert_eq!(
        samples.iter().map(|s| s.tps).collect::<Vec<_>>(),
        vec![100.0, 110.0, 130.0, 150.0]
    );
    assert!(samples.windows(2).all(|w| w[0].elapsed_seconds <= w[1].elapsed_seconds));
}

/// Script that records its own pid and a background child's pid.
fn pid_script(dir: &std::path::Path, body: &str) -> String {
    format!(
        r#"echo $$ > {dir}/main.pid
sleep 300 >/dev/null 2>&1 &
echo $! > {dir}/child.pid
{body}"#,
        dir = dir.display()
    )
}

fn read_pid(dir: &std::path::Path, name: &str) -> i32 {
    std::fs::read_to_string(dir.join(name))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

async fn assert_no_orphans(dir: &std::path::Path) {
    for name in ["main.pid", "child.pid"] {
        let pid = read_pid(dir, name);
        assert!(
            wait_gone(pid, Duration::from_secs(3)).await,
            "{name} ({pid}) still running"
        );
    }
}

#[tokio::test]
async fn test_no_orphans_after_normal_stop() {
    let dir = tempfile::tempdir().unwrap();
    let script = pid_script(dir.path(), &progress_forever("0.2"));
    let runner = runner(ShellLauncher::stderr(script), 0.0, 60.0);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(secs(1.0)).await;
        trigger.cancel();
    });

    let report = runner
        .run(&test_case(), MemoryOutput::new().metric_sink().unwrap(), cancel)
        .await
        .unwrap();
    assert_eq!(report.stop, RunnerStop::Requested);
    assert_no_orphans(dir.path()).await;
}

#[tokio::test]
async fn test_no_orphans_when_generator_ignores_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("trap '' TERM\n{}", progress_forever("0.2"));
    let script = pid_script(dir.path(), &body);
    let runner = runner(ShellLauncher::stderr(script), 0.0, 1.0);

    let started = Instant::now();
    let report = runner
        .run(&test_case(), MemoryOutput::new().metric_sink().unwrap(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.stop, RunnerStop::BudgetElapsed);
    // budget plus the termination grace, with slack
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_no_orphans(dir.path()).await;
}

#[tokio::test]
async fn test_no_orphans_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let body = r#"echo "progress: 1.0 s, 100.0 tps, lat 1.0 ms stddev 0.1" >&2
sleep 0.3
kill -9 $$"#;
    let script = pid_script(dir.path(), body);
    let runner = runner(ShellLauncher::stderr(script), 0.0, 30.0);

    let err = runner
        .run(&test_case(), MemoryOutput::new().metric_sink().unwrap(), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        BenchError::WorkloadExited { elapsed, status, .. } => {
            assert!(elapsed < Duration::from_secs(5));
            assert!(status.contains("terminated"), "{status}");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_no_orphans(dir.path()).await;
}

#[tokio::test]
async fn test_exit_noticed_while_descendant_holds_output() {
    let dir = tempfile::tempdir().unwrap();
    // the background sleep inherits stderr and keeps it open
    let script = format!(
        r#"sleep 300 &
echo $! > {dir}/holder.pid
echo "progress: 1.0 s, 100.0 tps, lat 1.0 ms stddev 0.1" >&2
sleep 0.3
exit 3"#,
        dir = dir.path().display()
    );
    let runner = runner(ShellLauncher::stderr(script), 0.0, 3.0);
    let output = MemoryOutput::new();

    let started = Instant::now();
    let err = runner
        .run(&test_case(), output.metric_sink().unwrap(), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        BenchError::WorkloadExited { elapsed, status, .. } => {
            assert!(status.contains("exit code 3"), "{status}");
            assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(output.metrics.lock().len(), 1);

    let holder = read_pid(dir.path(), "holder.pid");
    assert!(wait_gone(holder, Duration::from_secs(3)).await, "holder ({holder}) still running");
}

#[tokio::test]
async fn test_progress_read_from_stdout_when_configured() {
    let launcher = ShellLauncher {
        script: r#"echo "noise" >&2
echo "progress: 1.0 s, 42.0 tps, lat 3.0 ms stddev 1.0"
sleep 60"#
            .to_string(),
        progress: ProgressStream::Stdout,
    };
    let runner = runner(launcher, 0.0, 0.8);
    let output = MemoryOutput::new();

    runner
        .run(&test_case(), output.metric_sink().unwrap(), CancellationToken::new())
        .await
        .unwrap();

    let samples = output.metrics.lock().clone();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].tps, 42.0);
    assert_eq!(samples[0].test_case, TestCaseKind::ReadOnlyFullyCached);
}
