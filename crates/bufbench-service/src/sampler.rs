//! Periodic host resource sampler.
//!
//! Runs on its own clock, independent of the workload and of resizing. The
//! first sample is taken one period after start; a probe may never hold a
//! tick longer than one period, and a late tick fires immediately instead of
//! waiting a full period again, so drift never exceeds one missed tick.

use std::time::Duration;

use async_trait::async_trait;
use bufbench_core::{BenchResult, CpuProbe, RecordSink, ResourceSample, TestCaseKind};
use chrono::Utc;
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Global CPU utilisation read through `sysinfo`.
pub struct SysinfoCpuProbe {
    system: System,
}

impl SysinfoCpuProbe {
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        // the first reading after construction is always 0
        system.refresh_cpu();
        Self { system }
    }
}

impl Default for SysinfoCpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CpuProbe for SysinfoCpuProbe {
    async fn cpu_percent(&mut self) -> BenchResult<f64> {
        self.system.refresh_cpu();
        Ok(f64::from(self.system.global_cpu_info().cpu_usage()))
    }
}

/// Counters reported when the sampler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    /// Samples written to the sink.
    pub samples: usize,
    /// Ticks that produced no sample (probe error, probe timeout or sink error).
    pub skipped: usize,
    /// Ticks that fired at least one period late.
    pub late_ticks: usize,
}

/// Handle to a running sampler task.
pub struct ResourceSampler {
    cancel: CancellationToken,
    handle: JoinHandle<SamplerStats>,
}

impl ResourceSampler {
    /// Starts sampling every `period` until [`stop`](Self::stop) is called or
    /// `parent` is cancelled.
    pub fn start<P>(
        probe: P,
        sink: Box<dyn RecordSink<ResourceSample>>,
        period: Duration,
        test_case: TestCaseKind,
        parent: &CancellationToken,
    ) -> Self
    where
        P: CpuProbe + 'static,
    {
        Self::spawn(None, probe, sink, period, test_case, parent)
    }

    /// Like [`start`](Self::start), but the first period only begins once
    /// `gate` fires. If the sender is dropped instead, the sampler ends
    /// without taking a sample.
    pub fn start_after<P>(
        gate: oneshot::Receiver<()>,
        probe: P,
        sink: Box<dyn RecordSink<ResourceSample>>,
        period: Duration,
        test_case: TestCaseKind,
        parent: &CancellationToken,
    ) -> Self
    where
        P: CpuProbe + 'static,
    {
        Self::spawn(Some(gate), probe, sink, period, test_case, parent)
    }

    fn spawn<P>(
        gate: Option<oneshot::Receiver<()>>,
        probe: P,
        sink: Box<dyn RecordSink<ResourceSample>>,
        period: Duration,
        test_case: TestCaseKind,
        parent: &CancellationToken,
    ) -> Self
    where
        P: CpuProbe + 'static,
    {
        let cancel = parent.child_token();
        let span = info_span!("sampler", component = "resource_sampler", test_case = %test_case);
        let gated = cancel.clone();
        let handle = tokio::spawn(
            async move {
                if let Some(gate) = gate {
                    tokio::select! {
                        biased;
                        () = gated.cancelled() => return SamplerStats::default(),
                        opened = gate => {
                            if opened.is_err() {
                                debug!("workload never started, resource sampler idle");
                                return SamplerStats::default();
                            }
                        }
                    }
                }
                sample_loop(probe, sink, period, gated).await
            }
            .instrument(span),
        );

        Self { cancel, handle }
    }

    /// Stops the sampler and waits for the in-flight cycle to finish.
    ///
    /// No sample is written after this returns.
    pub async fn stop(self) -> SamplerStats {
        self.cancel.cancel();
        match self.handle.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "resource sampler task ended abnormally");
                SamplerStats::default()
            }
        }
    }
}

async fn sample_loop<P: CpuProbe>(
    mut probe: P,
    mut sink: Box<dyn RecordSink<ResourceSample>>,
    period: Duration,
    cancel: CancellationToken,
) -> SamplerStats {
    let mut stats = SamplerStats::default();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(period_ms = period.as_millis() as u64, "resource sampler started");

    loop {
        let scheduled = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            at = ticker.tick() => at,
        };

        let lateness = Instant::now().saturating_duration_since(scheduled);
        if lateness >= period {
            stats.late_ticks += 1;
            warn!(late_ms = lateness.as_millis() as u64, "resource sampler missed a tick");
        }

        let cpu = match timeout(period, probe.cpu_percent()).await {
            Ok(Ok(cpu)) => cpu,
            Ok(Err(e)) => {
                stats.skipped += 1;
                warn!(error = %e, "resource probe failed, skipping tick");
                continue;
            }
            Err(_) => {
                stats.skipped += 1;
                warn!("resource probe exceeded the sampling period, skipping tick");
                continue;
            }
        };

        let sample = ResourceSample {
            timestamp: Utc::now(),
            cpu_percent: if cpu.is_finite() { cpu.clamp(0.0, 100.0) } else { 0.0 },
        };
        match sink.append(&sample) {
            Ok(()) => {
                stats.samples += 1;
                debug!(cpu_percent = sample.cpu_percent, "resource sample");
            }
            Err(e) => {
                stats.skipped += 1;
                warn!(error = %e, "failed to write resource sample");
            }
        }
    }

    if let Err(e) = sink.flush() {
        warn!(error = %e, "failed to flush resource stream");
    }
    info!(
        samples = stats.samples,
        skipped = stats.skipped,
        late_ticks = stats.late_ticks,
        "resource sampler stopped"
    );
    stats
}
