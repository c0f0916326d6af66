//! Test-case sequencing.
//!
//! For each test case the orchestrator provisions a dataset, then runs three
//! workers side by side under one measuring budget: the workload runner, the
//! resource sampler and the capacity controller. Test cases never overlap.

use std::sync::Arc;
use std::time::Duration;

use bufbench_core::{
    BenchError, BenchResult, CapacityChanger, CapacitySchedule, CpuProbe, DatasetProvisioner,
    TestCase,
};
use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::controller::{
    CapacityController, ControllerOutcome, ControllerSettings, ControllerSinks, ControllerStatus,
};
use crate::report::{RunReport, TestCaseReport, TestCaseState};
use crate::runner::{
    RunnerReport, RunnerSettings, RunnerSignals, RunnerStop, WorkloadLauncher, WorkloadRunner,
};
use crate::sampler::{ResourceSampler, SamplerStats, SysinfoCpuProbe};
use crate::sink::OutputStreams;

/// Builds a fresh CPU probe for every test case.
pub type ProbeFactory = Arc<dyn Fn() -> Box<dyn CpuProbe> + Send + Sync>;

/// Resolved settings for a run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Test cases in execution order.
    pub test_cases: Vec<TestCase>,
    pub schedule: CapacitySchedule,
    /// Resource sampling period.
    pub sample_period: Duration,
    /// Extra time past the planned duration before the workload is stopped.
    pub overrun_allowance: Duration,
    /// Wait before retrying a failed resize.
    pub retry_backoff: Duration,
    /// Grace period for the generator to exit after SIGTERM.
    pub terminate_grace: Duration,
    /// Start the generator again when a resize ends its connections, as a
    /// server restart does.
    pub relaunch_during_resize: bool,
}

impl OrchestratorConfig {
    /// Hard limit for the measuring state of one test case.
    #[must_use]
    pub fn measuring_budget(&self) -> Duration {
        self.schedule.planned_duration() + self.overrun_allowance
    }
}

/// Runs test cases one after another against the given collaborators.
pub struct Orchestrator {
    config: OrchestratorConfig,
    provisioner: Arc<dyn DatasetProvisioner>,
    changer: Arc<dyn CapacityChanger>,
    launcher: Arc<dyn WorkloadLauncher>,
    outputs: Arc<dyn OutputStreams>,
    probes: ProbeFactory,
}

impl Orchestrator {
    /// Creates an orchestrator sampling CPU through `sysinfo`.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        provisioner: Arc<dyn DatasetProvisioner>,
        changer: Arc<dyn CapacityChanger>,
        launcher: Arc<dyn WorkloadLauncher>,
        outputs: Arc<dyn OutputStreams>,
    ) -> Self {
        Self {
            config,
            provisioner,
            changer,
            launcher,
            outputs,
            probes: Arc::new(|| Box::new(SysinfoCpuProbe::new()) as Box<dyn CpuProbe>),
        }
    }

    /// Replaces the CPU probe source.
    #[must_use]
    pub fn with_probe_factory(mut self, probes: ProbeFactory) -> Self {
        self.probes = probes;
        self
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Runs every configured test case.
    ///
    /// Only an unreachable database is returned as an error; every other
    /// failure is confined to its test case and recorded in the report.
    /// Cancelling `cancel` stops the current test case and skips the rest.
    pub async fn run(&self, cancel: &CancellationToken) -> BenchResult<RunReport> {
        let started_at = Utc::now();

        if let Err(e) = self.provisioner.ping().await {
            error!(error = %e, "database unreachable, aborting run");
            return Err(match e {
                BenchError::Unreachable(_) => e,
                other => BenchError::Unreachable(other.to_string()),
            });
        }

        info!(
            test_cases = self.config.test_cases.len(),
            sequence = ?self.config.schedule.sequence.values(),
            planned_secs = self.config.schedule.planned_duration().as_secs(),
            budget_secs = self.config.measuring_budget().as_secs(),
            "benchmark run started"
        );

        let mut reports = Vec::with_capacity(self.config.test_cases.len());
        let mut interrupted = false;
        for test_case in &self.config.test_cases {
            if cancel.is_cancelled() {
                interrupted = true;
                reports.push(TestCaseReport::pending(test_case.kind));
                continue;
            }

            let span = info_span!("test_case", test_case = %test_case.kind);
            let report = self.run_test_case(test_case, cancel).instrument(span).await;
            if cancel.is_cancelled() {
                interrupted = true;
            }
            reports.push(report);
        }

        let run = RunReport {
            started_at,
            finished_at: Utc::now(),
            interrupted,
            test_cases: reports,
        };
        info!(
            completed = run.completed(),
            failed = run.failed(),
            interrupted,
            "benchmark run finished"
        );
        Ok(run)
    }

    async fn run_test_case(&self, test_case: &TestCase, cancel: &CancellationToken) -> TestCaseReport {
        let mut report = TestCaseReport::pending(test_case.kind);
        report.started_at = Some(Utc::now());

        transition(&mut report, TestCaseState::Preparing);
        if let Err(e) = self.provisioner.create_dataset(test_case).await {
            error!(error = %e, "dataset provisioning failed, skipping test case");
            report.fail(e.to_string());
            self.cleanup(test_case, &mut report).await;
            return report;
        }

        if cancel.is_cancelled() {
            report.fail("interrupted before measuring");
        } else {
            transition(&mut report, TestCaseState::Measuring);
            if let Err(e) = self.measure(test_case, cancel, &mut report).await {
                error!(error = %e, "could not start measuring");
                report.fail(e.to_string());
            }
        }

        self.cleanup(test_case, &mut report).await;
        report
    }

    /// Runs the three workers and records how they ended.
    async fn measure(
        &self,
        test_case: &TestCase,
        cancel: &CancellationToken,
        report: &mut TestCaseReport,
    ) -> BenchResult<()> {
        let kind = test_case.kind;
        let schedule = &self.config.schedule;

        let metric_sink = self.outputs.metric_sink()?;
        let controller_sinks = ControllerSinks {
            resizes: self.outputs.resize_sink()?,
            capacities: self.outputs.capacity_sink()?,
        };
        let resource_sink = self.outputs.resource_sink()?;

        let case_cancel = cancel.child_token();
        let clock = Instant::now();

        // the sampler lives strictly inside the generator's lifetime
        let (started_tx, started_rx) = oneshot::channel();
        let runner_stopping = case_cancel.child_token();
        let sampler = ResourceSampler::start_after(
            started_rx,
            (self.probes)(),
            resource_sink,
            self.config.sample_period,
            kind,
            &runner_stopping,
        );

        let (controller, status) = CapacityController::new(
            Arc::clone(&self.changer),
            schedule.sequence.clone(),
            ControllerSettings {
                initial_delay: schedule.warmup,
                hold: schedule.hold,
                settle: schedule.settle,
                retry_backoff: self.config.retry_backoff,
            },
        );
        let controller_cancel = case_cancel.child_token();
        let mut controller_task = tokio::spawn(
            controller
                .run(kind, controller_sinks, controller_cancel.clone())
                .instrument(info_span!("controller", component = "capacity_controller", test_case = %kind)),
        );

        let mut runner = WorkloadRunner::new(
            Arc::clone(&self.launcher),
            RunnerSettings {
                warmup: schedule.warmup,
                budget: self.config.measuring_budget(),
                terminate_grace: self.config.terminate_grace,
            },
        );
        if self.config.relaunch_during_resize {
            runner = runner.relaunch_across_resizes(status.clone());
        }
        let runner_cancel = case_cancel.child_token();
        let signals = RunnerSignals {
            started: Some(started_tx),
            stopping: runner_stopping,
        };
        let runner_fut = runner
            .run_signalled(test_case, metric_sink, runner_cancel.clone(), signals)
            .instrument(info_span!("runner", component = "workload_runner", test_case = %kind));
        tokio::pin!(runner_fut);

        let first = tokio::select! {
            joined = &mut controller_task => First::Controller(joined_outcome(joined)),
            result = &mut runner_fut => First::Runner(result),
        };

        // The runner cancels `runner_stopping` itself when it stops on its
        // own; otherwise the sampler is stopped here before the generator is
        // drained.
        let (runner_result, outcome, stats) = match first {
            First::Controller(outcome @ ControllerOutcome::Aborted { .. }) => {
                if let ControllerOutcome::Aborted { failed_target, error, .. } = &outcome {
                    escalate(
                        &status,
                        clock,
                        &format!("resize to {failed_target}GB failed ({error}); workload continues until budget"),
                    );
                }
                let result = runner_fut.await;
                transition(report, TestCaseState::Draining);
                (result, outcome, sampler.stop().await)
            }
            First::Controller(outcome) => {
                match &outcome {
                    ControllerOutcome::Completed { .. } => {
                        info!("capacity sequence complete, stopping workload");
                    }
                    ControllerOutcome::Crashed { error } => {
                        escalate(&status, clock, &format!("capacity controller failed: {error}"));
                    }
                    _ => {}
                }
                transition(report, TestCaseState::Draining);
                let stats = sampler.stop().await;
                runner_cancel.cancel();
                (runner_fut.await, outcome, stats)
            }
            First::Runner(result) => {
                let reason = match &result {
                    Ok(r) if r.stop == RunnerStop::BudgetElapsed => {
                        "measuring budget elapsed before the capacity sequence finished".to_string()
                    }
                    Ok(_) => "workload stopped before the capacity sequence finished".to_string(),
                    Err(e) => e.to_string(),
                };
                escalate(&status, clock, &reason);
                transition(report, TestCaseState::Draining);
                let stats = sampler.stop().await;
                controller_cancel.cancel();
                (result, joined_outcome(controller_task.await), stats)
            }
        };
        case_cancel.cancel();

        report.measuring_secs = clock.elapsed().as_secs_f64();
        settle_report(report, runner_result, outcome, stats, cancel.is_cancelled());
        Ok(())
    }

    async fn cleanup(&self, test_case: &TestCase, report: &mut TestCaseReport) {
        if let Err(e) = self.provisioner.drop_dataset(test_case).await {
            warn!(error = %e, "failed to drop dataset");
            report.cleanup_error = Some(e.to_string());
        }

        if report.state != TestCaseState::Failed {
            transition(report, TestCaseState::Complete);
        } else {
            info!(reason = report.failure.as_deref().unwrap_or("unknown"), "test case failed");
        }
        report.finished_at = Some(Utc::now());
    }
}

enum First {
    Controller(ControllerOutcome),
    Runner(BenchResult<RunnerReport>),
}

fn transition(report: &mut TestCaseReport, state: TestCaseState) {
    info!(from = report.state.as_str(), to = state.as_str(), "test case state");
    report.state = state;
}

fn joined_outcome(joined: Result<ControllerOutcome, JoinError>) -> ControllerOutcome {
    joined.unwrap_or_else(|e| {
        error!(error = %e, "capacity controller task panicked");
        ControllerOutcome::Crashed {
            error: e.to_string(),
        }
    })
}

fn escalate(status: &watch::Receiver<ControllerStatus>, clock: Instant, reason: &str) {
    let status = *status.borrow();
    warn!(
        elapsed_s = clock.elapsed().as_secs_f64(),
        last_capacity_gb = ?status.current_gb,
        target_gb = ?status.target_gb,
        resizing = status.resizing,
        applied = status.applied,
        reason,
        "test case escalation"
    );
}

/// Folds the three worker results into the report.
fn settle_report(
    report: &mut TestCaseReport,
    runner: BenchResult<RunnerReport>,
    outcome: ControllerOutcome,
    stats: SamplerStats,
    interrupted: bool,
) {
    report.resource_samples = stats.samples;
    report.skipped_resource_ticks = stats.skipped;
    report.applied_capacities_gb = outcome.applied().to_vec();

    if interrupted {
        report.fail("interrupted");
    }

    match runner {
        Ok(runner) => {
            report.warmup_samples = Some(runner.warmup_samples);
            report.measurement_samples = Some(runner.measurement_samples);
            report.skipped_lines = runner.skipped_lines;
            report.generator_relaunches = runner.relaunches;
        }
        Err(e) => report.fail(e.to_string()),
    }

    match outcome {
        ControllerOutcome::Completed { .. } => {}
        ControllerOutcome::Aborted {
            failed_target, error, ..
        } => report.fail(format!("capacity sequence aborted at {failed_target}GB: {error}")),
        ControllerOutcome::Cancelled { .. } => {
            report.fail("capacity sequence did not complete within the measuring budget");
        }
        ControllerOutcome::Crashed { error } => {
            report.fail(format!("capacity controller failed: {error}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bufbench_core::{CapacitySequence, TestCaseKind, WorkloadSettings};

    fn config(sequence: Vec<u32>) -> OrchestratorConfig {
        OrchestratorConfig {
            test_cases: vec![TestCase::resolve(TestCaseKind::Select1, &WorkloadSettings::default())],
            schedule: CapacitySchedule {
                sequence: CapacitySequence::new(sequence).unwrap(),
                warmup: Duration::from_secs(2),
                hold: Duration::from_secs(5),
                settle: Duration::from_secs(1),
            },
            sample_period: Duration::from_secs(1),
            overrun_allowance: Duration::from_secs(3),
            retry_backoff: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(1),
            relaunch_during_resize: false,
        }
    }

    fn runner_ok() -> BenchResult<RunnerReport> {
        Ok(RunnerReport {
            stop: RunnerStop::Requested,
            elapsed: Duration::from_secs(13),
            warmup_samples: 2,
            measurement_samples: 11,
            skipped_lines: 0,
            relaunches: 0,
        })
    }

    #[test]
    fn test_measuring_budget_adds_overrun() {
        // 2 + 5 + 1 + 5, plus 3 allowance
        assert_eq!(config(vec![4, 8]).measuring_budget(), Duration::from_secs(16));
    }

    #[test]
    fn test_clean_outcome_keeps_state() {
        let mut report = TestCaseReport::pending(TestCaseKind::Select1);
        report.state = TestCaseState::Draining;
        settle_report(
            &mut report,
            runner_ok(),
            ControllerOutcome::Completed { applied: vec![4, 8] },
            SamplerStats {
                samples: 13,
                skipped: 0,
                late_ticks: 0,
            },
            false,
        );

        assert_eq!(report.state, TestCaseState::Draining);
        assert_eq!(report.applied_capacities_gb, vec![4, 8]);
        assert_eq!(report.measurement_samples, Some(11));
        assert_eq!(report.resource_samples, 13);
        assert!(report.failure.is_none());
    }

    #[test]
    fn test_aborted_sequence_fails_case_but_keeps_counts() {
        let mut report = TestCaseReport::pending(TestCaseKind::Select1);
        settle_report(
            &mut report,
            runner_ok(),
            ControllerOutcome::Aborted {
                applied: vec![4],
                failed_target: 8,
                error: "boom".to_string(),
            },
            SamplerStats::default(),
            false,
        );

        assert_eq!(report.state, TestCaseState::Failed);
        assert_eq!(report.warmup_samples, Some(2));
        assert!(report.failure.as_deref().unwrap().contains("aborted at 8GB"));
    }

    #[test]
    fn test_budget_overrun_reports_incomplete_sequence() {
        let mut report = TestCaseReport::pending(TestCaseKind::Select1);
        let mut runner = runner_ok().unwrap();
        runner.stop = RunnerStop::BudgetElapsed;
        settle_report(
            &mut report,
            Ok(runner),
            ControllerOutcome::Cancelled { applied: vec![4] },
            SamplerStats::default(),
            false,
        );

        assert_eq!(report.state, TestCaseState::Failed);
        assert!(report
            .failure
            .as_deref()
            .unwrap()
            .contains("did not complete within the measuring budget"));
    }

    #[tokio::test]
    async fn test_controller_panic_is_reported_without_a_target() {
        let task = tokio::spawn(async {
            if true {
                panic!("controller bug");
            }
            ControllerOutcome::Completed { applied: vec![] }
        });
        let outcome = joined_outcome(task.await);
        assert!(matches!(outcome, ControllerOutcome::Crashed { .. }));

        let mut report = TestCaseReport::pending(TestCaseKind::Select1);
        settle_report(&mut report, runner_ok(), outcome, SamplerStats::default(), false);

        let failure = report.failure.unwrap();
        assert!(failure.starts_with("capacity controller failed"), "{failure}");
        assert!(!failure.contains("0GB"));
        assert!(report.applied_capacities_gb.is_empty());
    }
}
