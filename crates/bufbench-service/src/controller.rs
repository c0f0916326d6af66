//! Capacity sequencing for one test case.
//!
//! The controller is the only component that mutates the capacity
//! parameter. Resizes are strictly serialized: a `resize_start` event is
//! always followed by its `resize_end` (or by nothing, when the resize
//! failed) before the next start is emitted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bufbench_core::{
    BenchError, BenchResult, CapacityChangeRecord, CapacityChanger, CapacitySequence,
    RecordSink, ResizeEvent, ResizeStatus, TestCaseKind,
};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Live view of the controller, published after every state change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStatus {
    /// Last capacity known to be in effect.
    pub current_gb: Option<u32>,
    /// Target of the resize in flight or last attempted.
    pub target_gb: Option<u32>,
    /// True between `resize_start` and `resize_end`.
    pub resizing: bool,
    /// Number of targets applied so far.
    pub applied: usize,
}

/// Timings the controller follows.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// Wait before the first resize; equals the warmup window.
    pub initial_delay: Duration,
    /// Time each applied capacity stays in effect.
    pub hold: Duration,
    /// Pause between a hold and the next resize.
    pub settle: Duration,
    /// Wait before the single retry of a failed resize.
    pub retry_backoff: Duration,
}

/// Destinations for the controller's two record streams.
pub struct ControllerSinks {
    pub resizes: Box<dyn RecordSink<ResizeEvent>>,
    pub capacities: Box<dyn RecordSink<CapacityChangeRecord>>,
}

/// How a capacity sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerOutcome {
    /// Every target was applied and held.
    Completed { applied: Vec<u32> },
    /// A target failed twice; the rest of the sequence was abandoned.
    Aborted {
        applied: Vec<u32>,
        failed_target: u32,
        error: String,
    },
    /// Stopped by the orchestrator before the sequence finished.
    Cancelled { applied: Vec<u32> },
    /// The controller task itself died; what it applied is unknown.
    Crashed { error: String },
}

impl ControllerOutcome {
    #[must_use]
    pub fn applied(&self) -> &[u32] {
        match self {
            Self::Completed { applied }
            | Self::Aborted { applied, .. }
            | Self::Cancelled { applied } => applied,
            Self::Crashed { .. } => &[],
        }
    }
}

/// Applies a [`CapacitySequence`] with hold and settle windows.
pub struct CapacityController {
    changer: Arc<dyn CapacityChanger>,
    sequence: CapacitySequence,
    settings: ControllerSettings,
    status: watch::Sender<ControllerStatus>,
}

impl CapacityController {
    /// Creates a controller and the receiver of its status updates.
    #[must_use]
    pub fn new(
        changer: Arc<dyn CapacityChanger>,
        sequence: CapacitySequence,
        settings: ControllerSettings,
    ) -> (Self, watch::Receiver<ControllerStatus>) {
        let (status, receiver) = watch::channel(ControllerStatus::default());
        (
            Self {
                changer,
                sequence,
                settings,
                status,
            },
            receiver,
        )
    }

    /// Runs the whole sequence for `test_case`.
    ///
    /// Returns early with [`ControllerOutcome::Cancelled`] when `cancel`
    /// fires. A resize already in flight is allowed to finish first.
    pub async fn run(
        self,
        test_case: TestCaseKind,
        mut sinks: ControllerSinks,
        cancel: CancellationToken,
    ) -> ControllerOutcome {
        let mut applied = Vec::with_capacity(self.sequence.len());
        let mut current = match self.changer.current_capacity().await {
            Ok(gb) => Some(gb),
            Err(e) => {
                warn!(error = %e, "could not read starting capacity");
                None
            }
        };
        self.publish(|s| s.current_gb = current);

        info!(sequence = ?self.sequence.values(), "capacity controller started");

        if !pause(self.settings.initial_delay, &cancel).await {
            return Self::finish(&mut sinks, ControllerOutcome::Cancelled { applied });
        }

        let total = self.sequence.len();
        for (idx, &target) in self.sequence.values().iter().enumerate() {
            if idx > 0 && !pause(self.settings.settle, &cancel).await {
                break;
            }
            if cancel.is_cancelled() {
                break;
            }

            info!(step = idx + 1, total, target_gb = target, "resizing");
            self.publish(|s| {
                s.target_gb = Some(target);
                s.resizing = true;
            });

            let started_at = Utc::now();
            emit(
                sinks.resizes.as_mut(),
                &ResizeEvent {
                    timestamp: started_at,
                    status: ResizeStatus::ResizeStart,
                    old_capacity_gb: current,
                    new_capacity_gb: target,
                    test_case,
                },
            );

            let clock = Instant::now();
            if let Err(e) = self.apply(target, &cancel).await {
                self.publish(|s| s.resizing = false);
                if cancel.is_cancelled() {
                    warn!(target_gb = target, error = %e, "resize abandoned on cancellation");
                    break;
                }
                error!(
                    target_gb = target,
                    last_capacity_gb = ?current,
                    error = %e,
                    "resize failed after retry, abandoning remaining targets"
                );
                return Self::finish(
                    &mut sinks,
                    ControllerOutcome::Aborted {
                        applied,
                        failed_target: target,
                        error: e.to_string(),
                    },
                );
            }
            let took = clock.elapsed();

            emit(
                sinks.resizes.as_mut(),
                &ResizeEvent {
                    timestamp: not_before(started_at),
                    status: ResizeStatus::ResizeEnd,
                    old_capacity_gb: current,
                    new_capacity_gb: target,
                    test_case,
                },
            );
            info!(target_gb = target, resize_ms = took.as_millis() as u64, "resize complete");

            let confirmed = self.confirm(target).await;
            emit(
                sinks.capacities.as_mut(),
                &CapacityChangeRecord {
                    timestamp: Utc::now(),
                    capacity_gb: confirmed,
                },
            );
            current = Some(confirmed);
            applied.push(target);
            self.publish(|s| {
                s.current_gb = current;
                s.resizing = false;
                s.applied += 1;
            });

            if !pause(self.settings.hold, &cancel).await {
                break;
            }
        }

        let outcome = if applied.len() == total && !cancel.is_cancelled() {
            ControllerOutcome::Completed { applied }
        } else {
            ControllerOutcome::Cancelled { applied }
        };
        Self::finish(&mut sinks, outcome)
    }

    /// Calls the capacity changer, retrying once after the backoff.
    async fn apply(&self, target: u32, cancel: &CancellationToken) -> BenchResult<()> {
        let first = match self.changer.set_capacity(target).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(target_gb = target, error = %first, "resize failed, retrying once");

        if !pause(self.settings.retry_backoff, cancel).await {
            return Err(first);
        }
        self.changer.set_capacity(target).await.map_err(|second| {
            BenchError::capacity(target, format!("{first}; retry: {second}"))
        })
    }

    /// Reads back the capacity in effect, falling back to the target.
    async fn confirm(&self, target: u32) -> u32 {
        match self.changer.current_capacity().await {
            Ok(observed) if observed == target => observed,
            Ok(observed) => {
                warn!(target_gb = target, observed_gb = observed, "capacity differs from target");
                observed
            }
            Err(e) => {
                warn!(target_gb = target, error = %e, "could not confirm capacity, recording target");
                target
            }
        }
    }

    fn publish(&self, update: impl FnOnce(&mut ControllerStatus)) {
        self.status.send_modify(update);
    }

    fn finish(sinks: &mut ControllerSinks, outcome: ControllerOutcome) -> ControllerOutcome {
        if let Err(e) = sinks.resizes.flush() {
            warn!(error = %e, "failed to flush resize stream");
        }
        if let Err(e) = sinks.capacities.flush() {
            warn!(error = %e, "failed to flush capacity stream");
        }
        info!(outcome = ?outcome, "capacity controller finished");
        outcome
    }
}

/// Sleeps for `duration`; returns false if cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

fn not_before(start: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(start)
}

fn emit<R>(sink: &mut dyn RecordSink<R>, record: &R) {
    if let Err(e) = sink.append(record) {
        warn!(error = %e, "failed to write controller record");
    }
}
