//! Capacity attribution by timestamp join.
//!
//! Metric samples do not carry the capacity they were measured under. The
//! capacity in effect for a sample is the one from the nearest preceding
//! [`CapacityChangeRecord`], so the runner stays decoupled from the
//! controller and the association is rebuilt offline.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::record::{CapacityChangeRecord, MetricSample, Phase};

/// Capacity in effect at `at`, or `None` before the first recorded change.
///
/// `changes` must be sorted by timestamp.
#[must_use]
pub fn capacity_at(changes: &[CapacityChangeRecord], at: DateTime<Utc>) -> Option<u32> {
    let idx = changes.partition_point(|change| change.timestamp <= at);
    idx.checked_sub(1).map(|i| changes[i].capacity_gb)
}

/// Pairs every sample with the capacity in effect when it was taken.
#[must_use]
pub fn attribute<'a>(
    samples: &'a [MetricSample],
    changes: &[CapacityChangeRecord],
) -> Vec<(&'a MetricSample, Option<u32>)> {
    let changes = sorted(changes);
    samples
        .iter()
        .map(|sample| (sample, capacity_at(&changes, sample.timestamp)))
        .collect()
}

/// Aggregate of measurement-phase samples taken under one capacity window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityWindow {
    /// Capacity in effect; `None` for samples before any change was recorded.
    pub capacity_gb: Option<u32>,
    /// When the window opened; `None` for the pre-change window.
    pub started_at: Option<DateTime<Utc>>,
    pub samples: usize,
    pub mean_tps: f64,
    pub mean_latency_ms: f64,
}

/// Groups measurement-phase samples into capacity windows.
///
/// One window per change record (in timestamp order) plus a leading window
/// for samples that precede every change. Windows without samples are
/// omitted.
#[must_use]
pub fn capacity_windows(
    samples: &[MetricSample],
    changes: &[CapacityChangeRecord],
) -> Vec<CapacityWindow> {
    let changes = sorted(changes);
    // slot 0 is the pre-change window, slot i + 1 is changes[i]
    let mut totals = vec![(0_usize, 0.0_f64, 0.0_f64); changes.len() + 1];

    for sample in samples.iter().filter(|s| s.phase == Phase::Measurement) {
        let slot = changes.partition_point(|change| change.timestamp <= sample.timestamp);
        let entry = &mut totals[slot];
        entry.0 += 1;
        entry.1 += sample.tps;
        entry.2 += sample.latency_avg_ms;
    }

    totals
        .into_iter()
        .enumerate()
        .filter(|(_, (count, _, _))| *count > 0)
        .map(|(slot, (count, tps, latency))| {
            let change = slot.checked_sub(1).map(|i| &changes[i]);
            CapacityWindow {
                capacity_gb: change.map(|c| c.capacity_gb),
                started_at: change.map(|c| c.timestamp),
                samples: count,
                mean_tps: tps / count as f64,
                mean_latency_ms: latency / count as f64,
            }
        })
        .collect()
}

fn sorted(changes: &[CapacityChangeRecord]) -> Vec<CapacityChangeRecord> {
    let mut changes = changes.to_vec();
    changes.sort_by_key(|change| change.timestamp);
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_case::TestCaseKind;
    use chrono::Duration;

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn sample(offset_s: i64, phase: Phase, tps: f64) -> MetricSample {
        MetricSample {
            timestamp: base() + Duration::seconds(offset_s),
            test_case: TestCaseKind::ReadOnlyFullyCached,
            phase,
            elapsed_seconds: offset_s as f64,
            tps,
            latency_avg_ms: tps / 100.0,
            latency_stddev_ms: 0.1,
        }
    }

    fn change(offset_s: i64, capacity_gb: u32) -> CapacityChangeRecord {
        CapacityChangeRecord {
            timestamp: base() + Duration::seconds(offset_s),
            capacity_gb,
        }
    }

    #[test]
    fn test_nearest_preceding_change_wins() {
        let changes = vec![change(10, 4), change(20, 8)];
        assert_eq!(capacity_at(&changes, base()), None);
        assert_eq!(capacity_at(&changes, base() + Duration::seconds(10)), Some(4));
        assert_eq!(capacity_at(&changes, base() + Duration::seconds(19)), Some(4));
        assert_eq!(capacity_at(&changes, base() + Duration::seconds(25)), Some(8));
    }

    #[test]
    fn test_attribute_sorts_changes() {
        let samples = vec![sample(5, Phase::Warmup, 1.0), sample(15, Phase::Measurement, 2.0)];
        let changes = vec![change(12, 8), change(2, 4)];

        let attributed = attribute(&samples, &changes);
        assert_eq!(attributed[0].1, Some(4));
        assert_eq!(attributed[1].1, Some(8));
    }

    #[test]
    fn test_windows_skip_warmup_and_empty_windows() {
        let samples = vec![
            sample(1, Phase::Warmup, 999.0),
            sample(3, Phase::Measurement, 100.0),
            sample(11, Phase::Measurement, 200.0),
            sample(12, Phase::Measurement, 400.0),
            sample(31, Phase::Measurement, 50.0),
        ];
        let changes = vec![change(10, 4), change(20, 8), change(30, 12)];

        let windows = capacity_windows(&samples, &changes);
        assert_eq!(windows.len(), 3);

        assert_eq!(windows[0].capacity_gb, None);
        assert_eq!(windows[0].samples, 1);

        assert_eq!(windows[1].capacity_gb, Some(4));
        assert_eq!(windows[1].samples, 2);
        assert_eq!(windows[1].mean_tps, 300.0);
        assert_eq!(windows[1].mean_latency_ms, 3.0);

        assert_eq!(windows[2].capacity_gb, Some(12));
        assert_eq!(windows[2].started_at, Some(base() + Duration::seconds(30)));
    }
}
