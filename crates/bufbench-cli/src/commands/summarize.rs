use std::fmt::Write as _;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bufbench_core::{
    capacity_windows, CapacityChangeRecord, MetricSample, Phase, ResizeEvent, ResizeStatus,
    ResourceSample, TestCaseKind,
};
use bufbench_service::read_stream;
use bufbench_service::sink::{CAPACITY_STREAM, METRIC_STREAM, RESIZE_STREAM, RESOURCE_STREAM};

/// Streams of one run directory.
pub struct RunRecords {
    pub metrics: Vec<MetricSample>,
    pub resources: Vec<ResourceSample>,
    pub resizes: Vec<ResizeEvent>,
    pub capacities: Vec<CapacityChangeRecord>,
}

impl RunRecords {
    pub fn load(dir: &Path) -> Result<Self> {
        let load = |name: &str| dir.join(name);
        Ok(Self {
            metrics: read_stream(load(METRIC_STREAM)).context("failed to read metric stream")?,
            resources: read_stream(load(RESOURCE_STREAM))
                .context("failed to read resource stream")?,
            resizes: read_stream(load(RESIZE_STREAM)).context("failed to read resize stream")?,
            capacities: read_stream(load(CAPACITY_STREAM))
                .context("failed to read capacity stream")?,
        })
    }
}

/// Prints per-test-case, per-capacity statistics for `dir`.
pub fn summarize(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let records = RunRecords::load(dir)?;
    if records.metrics.is_empty() {
        bail!("no metric samples found in {}", dir.display());
    }

    print!("{}", render(&records));
    Ok(())
}

/// Renders the summary as plain-text tables.
pub fn render(records: &RunRecords) -> String {
    let mut out = String::new();

    let mut cases: Vec<TestCaseKind> = Vec::new();
    for sample in &records.metrics {
        if !cases.contains(&sample.test_case) {
            cases.push(sample.test_case);
        }
    }

    for case in cases {
        let samples: Vec<MetricSample> = records
            .metrics
            .iter()
            .filter(|s| s.test_case == case)
            .cloned()
            .collect();
        let warmup = samples.iter().filter(|s| s.phase == Phase::Warmup).count();

        let _ = writeln!(out, "== {case} ==");
        let _ = writeln!(
            out,
            "samples: {} ({} warmup, {} measurement)",
            samples.len(),
            warmup,
            samples.len() - warmup
        );
        let _ = writeln!(
            out,
            "{:>12}  {:>25}  {:>8}  {:>12}  {:>12}",
            "capacity", "window start", "samples", "mean tps", "mean lat ms"
        );
        for window in capacity_windows(&samples, &records.capacities) {
            let capacity = window
                .capacity_gb
                .map_or_else(|| "initial".to_string(), |gb| format!("{gb}GB"));
            let started = window
                .started_at
                .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
            let _ = writeln!(
                out,
                "{:>12}  {:>25}  {:>8}  {:>12.1}  {:>12.3}",
                capacity, started, window.samples, window.mean_tps, window.mean_latency_ms
            );
        }

        let durations = resize_durations_ms(&records.resizes, case);
        if !durations.is_empty() {
            let max = durations.iter().copied().fold(0.0_f64, f64::max);
            let mean = durations.iter().sum::<f64>() / durations.len() as f64;
            let _ = writeln!(
                out,
                "resizes: {} completed, mean {mean:.0} ms, max {max:.0} ms",
                durations.len()
            );
        }
        out.push('\n');
    }

    if !records.resources.is_empty() {
        let mean = records.resources.iter().map(|r| r.cpu_percent).sum::<f64>()
            / records.resources.len() as f64;
        let _ = writeln!(
            out,
            "cpu: {} samples, mean {mean:.1}%",
            records.resources.len()
        );
    }

    out
}

/// Durations of completed resizes for `case`, pairing each start with the
/// end that follows it.
fn resize_durations_ms(events: &[ResizeEvent], case: TestCaseKind) -> Vec<f64> {
    let mut durations = Vec::new();
    let mut open: Option<&ResizeEvent> = None;
    for event in events.iter().filter(|e| e.test_case == case) {
        match event.status {
            ResizeStatus::ResizeStart => open = Some(event),
            ResizeStatus::ResizeEnd => {
                if let Some(start) = open.take() {
                    let ms = (event.timestamp - start.timestamp).num_milliseconds();
                    durations.push(ms as f64);
                }
            }
        }
    }
    durations
}
