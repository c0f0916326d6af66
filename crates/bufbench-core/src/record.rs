//! Records emitted by the benchmark workers.
//!
//! Each record type is written to its own append-only stream. Field order is
//! the column order of that stream and the timestamp is always first, which
//! makes the timestamp the join key for offline analysis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::test_case::TestCaseKind;

/// Classification of a metric sample by elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Sample taken before the warmup window closed; discarded by analysis.
    Warmup,
    /// Sample retained for analysis.
    Measurement,
}

impl Phase {
    /// Returns the label written to the metric stream.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warmup => "warmup",
            Self::Measurement => "measurement",
        }
    }
}

/// Throughput and latency reported by one progress line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Wall-clock time the line was received.
    pub timestamp: DateTime<Utc>,
    /// Test case being measured.
    pub test_case: TestCaseKind,
    /// Warmup or measurement.
    pub phase: Phase,
    /// Seconds since the runner started.
    pub elapsed_seconds: f64,
    /// Transactions per second over the last interval.
    pub tps: f64,
    /// Mean latency over the last interval.
    pub latency_avg_ms: f64,
    /// Latency standard deviation over the last interval.
    pub latency_stddev_ms: f64,
}

/// Host CPU utilisation sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    /// Global CPU utilisation, clamped to `[0, 100]`.
    pub cpu_percent: f64,
}

/// Which edge of a resize a [`ResizeEvent`] marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeStatus {
    ResizeStart,
    ResizeEnd,
}

/// One edge of a capacity resize; always emitted in start/end pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeEvent {
    pub timestamp: DateTime<Utc>,
    pub status: ResizeStatus,
    /// Capacity before the resize, when it was known.
    pub old_capacity_gb: Option<u32>,
    /// Capacity requested by the resize.
    pub new_capacity_gb: u32,
    pub test_case: TestCaseKind,
}

/// A capacity value confirmed in effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityChangeRecord {
    pub timestamp: DateTime<Utc>,
    pub capacity_gb: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_labels_serialize_snake_case() {
        assert_eq!(serde_json::to_string(&Phase::Warmup).unwrap(), "\"warmup\"");
        assert_eq!(
            serde_json::to_string(&ResizeStatus::ResizeStart).unwrap(),
            "\"resize_start\""
        );
        assert_eq!(
            serde_json::to_string(&TestCaseKind::ReadOnlyFullyCached).unwrap(),
            "\"RO_FullyCached\""
        );
        assert_eq!(Phase::Measurement.as_str(), "measurement");
    }

    #[test]
    fn test_resize_event_field_order() {
        let event = ResizeEvent {
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            status: ResizeStatus::ResizeEnd,
            old_capacity_gb: Some(4),
            new_capacity_gb: 8,
            test_case: TestCaseKind::Select1,
        };

        let json = serde_json::to_string(&event).unwrap();
        let ts = json.find("timestamp").unwrap();
        let status = json.find("status").unwrap();
        let old = json.find("old_capacity_gb").unwrap();
        let case = json.find("test_case").unwrap();
        assert!(ts < status && status < old && old < case);
    }
}
