//! Run summaries written next to the record streams.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use bufbench_core::TestCaseKind;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle of one test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCaseState {
    /// Not started; the run ended before reaching it.
    Pending,
    Preparing,
    Measuring,
    Draining,
    Complete,
    Failed,
}

impl TestCaseState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Measuring => "measuring",
            Self::Draining => "draining",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of one test case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCaseReport {
    pub test_case: TestCaseKind,
    pub state: TestCaseState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds spent in the measuring state.
    pub measuring_secs: f64,
    /// Targets the controller applied, in order.
    pub applied_capacities_gb: Vec<u32>,
    /// `None` when the workload generator failed before reporting.
    pub warmup_samples: Option<usize>,
    pub measurement_samples: Option<usize>,
    pub skipped_lines: usize,
    /// Generator restarts after a resize ended its connections.
    pub generator_relaunches: usize,
    pub resource_samples: usize,
    pub skipped_resource_ticks: usize,
    /// First reason the test case failed.
    pub failure: Option<String>,
    /// Dataset teardown problem, reported separately from the outcome.
    pub cleanup_error: Option<String>,
}

impl TestCaseReport {
    #[must_use]
    pub fn pending(test_case: TestCaseKind) -> Self {
        Self {
            test_case,
            state: TestCaseState::Pending,
            started_at: None,
            finished_at: None,
            measuring_secs: 0.0,
            applied_capacities_gb: Vec::new(),
            warmup_samples: None,
            measurement_samples: None,
            skipped_lines: 0,
            generator_relaunches: 0,
            resource_samples: 0,
            skipped_resource_ticks: 0,
            failure: None,
            cleanup_error: None,
        }
    }

    /// Records a failure; the first reason wins.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = TestCaseState::Failed;
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == TestCaseState::Complete
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the run was interrupted before every test case ran.
    pub interrupted: bool,
    pub test_cases: Vec<TestCaseReport>,
}

impl RunReport {
    #[must_use]
    pub fn completed(&self) -> usize {
        self.test_cases.iter().filter(|t| t.is_complete()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.test_cases
            .iter()
            .filter(|t| t.state == TestCaseState::Failed)
            .count()
    }

    /// True when every test case completed.
    #[must_use]
    pub fn passes(&self) -> bool {
        !self.interrupted && self.completed() == self.test_cases.len()
    }
}

/// Report format options
#[derive(Debug, Clone, Copy)]
pub enum ReportFormat {
    Markdown,
    Json,
}

impl ReportFormat {
    #[must_use]
    pub const fn file_name(&self) -> &'static str {
        match self {
            Self::Markdown => "run_report.md",
            Self::Json => "run_report.json",
        }
    }
}

/// Writes a [`RunReport`] in the supported formats.
pub struct ResultWriter<'a> {
    report: &'a RunReport,
}

impl<'a> ResultWriter<'a> {
    #[must_use]
    pub fn new(report: &'a RunReport) -> Self {
        Self { report }
    }

    /// Write report to file
    pub fn write_report(&self, path: impl AsRef<Path>, format: ReportFormat) -> std::io::Result<()> {
        let content = match format {
            ReportFormat::Markdown => self.generate_markdown(),
            ReportFormat::Json => self.generate_json()?,
        };

        let mut file = File::create(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    /// Writes both formats into `dir` under their default names.
    pub fn write_all(&self, dir: impl AsRef<Path>) -> std::io::Result<()> {
        let dir = dir.as_ref();
        for format in [ReportFormat::Json, ReportFormat::Markdown] {
            self.write_report(dir.join(format.file_name()), format)?;
        }
        Ok(())
    }

    fn generate_json(&self) -> std::io::Result<String> {
        serde_json::to_string_pretty(self.report).map_err(std::io::Error::other)
    }

    fn generate_markdown(&self) -> String {
        let report = self.report;
        let status = if report.passes() { "PASS" } else { "FAIL" };
        let wall = (report.finished_at - report.started_at).num_seconds();

        let mut out = format!(
            r#"# Buffer Resize Benchmark Report

**Status**: {status}

- **Started**: {}
- **Finished**: {}
- **Wall time**: {wall} seconds
- **Test cases**: {} complete, {} failed, {} total
"#,
            report.started_at.to_rfc3339(),
            report.finished_at.to_rfc3339(),
            report.completed(),
            report.failed(),
            report.test_cases.len(),
        );
        if report.interrupted {
            out.push_str("- **Interrupted**: yes\n");
        }

        out.push_str(
            "\n---\n\n## Test Cases\n\n\
             | Test case | State | Capacities (GB) | Warmup | Measurement | Skipped lines | Relaunches | CPU samples | Measuring (s) |\n\
             |-----------|-------|-----------------|--------|-------------|---------------|------------|-------------|---------------|\n",
        );
        for case in &report.test_cases {
            let capacities = case
                .applied_capacities_gb
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(" → ");
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} | {} | {} | {:.1} |",
                case.test_case,
                case.state.as_str(),
                if capacities.is_empty() { "-".to_string() } else { capacities },
                count(case.warmup_samples),
                count(case.measurement_samples),
                case.skipped_lines,
                case.generator_relaunches,
                case.resource_samples,
                case.measuring_secs,
            );
        }

        let problems: Vec<&TestCaseReport> = report
            .test_cases
            .iter()
            .filter(|c| c.failure.is_some() || c.cleanup_error.is_some())
            .collect();
        if !problems.is_empty() {
            out.push_str("\n---\n\n## Failures\n\n");
            for case in problems {
                if let Some(reason) = &case.failure {
                    let _ = writeln!(out, "- **{}**: {reason}", case.test_case);
                }
                if let Some(reason) = &case.cleanup_error {
                    let _ = writeln!(out, "- **{}** (cleanup): {reason}", case.test_case);
                }
            }
        }

        out
    }
}

fn count(value: Option<usize>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
