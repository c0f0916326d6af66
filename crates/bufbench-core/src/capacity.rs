use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, BenchResult};

/// Ordered capacity targets (GB) applied during one test case.
///
/// Never empty and every value is positive; duplicates are allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct CapacitySequence(Vec<u32>);

impl CapacitySequence {
    /// Validates and wraps a list of targets.
    pub fn new(values: Vec<u32>) -> BenchResult<Self> {
        if values.is_empty() {
            return Err(BenchError::InvalidConfig(
                "capacity sequence must not be empty".to_string(),
            ));
        }
        if values.iter().any(|gb| *gb == 0) {
            return Err(BenchError::InvalidConfig(
                "capacity sequence values must be > 0".to_string(),
            ));
        }
        Ok(Self(values))
    }

    #[must_use]
    pub fn values(&self) -> &[u32] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<u32>> for CapacitySequence {
    type Error = BenchError;

    fn try_from(values: Vec<u32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<CapacitySequence> for Vec<u32> {
    fn from(sequence: CapacitySequence) -> Self {
        sequence.0
    }
}

/// Timing of the capacity sequence within one test case.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacitySchedule {
    pub sequence: CapacitySequence,
    /// Warmup before the first resize.
    pub warmup: Duration,
    /// How long each applied capacity stays in effect.
    pub hold: Duration,
    /// Pause after a hold before the next resize.
    pub settle: Duration,
}

impl CapacitySchedule {
    /// Planned length of the measuring state:
    /// `warmup + Σ(hold + settle) − settle`, excluding resize time.
    #[must_use]
    pub fn planned_duration(&self) -> Duration {
        let steps = self.sequence.len() as u32;
        self.warmup + self.hold * steps + self.settle * steps.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_and_zero() {
        assert!(CapacitySequence::new(vec![]).is_err());
        assert!(CapacitySequence::new(vec![4, 0, 8]).is_err());
        let seq = CapacitySequence::new(vec![4, 8, 4]).unwrap();
        assert_eq!(seq.values(), &[4, 8, 4]);
        assert!(!seq.is_empty());
    }

    #[test]
    fn test_planned_duration_skips_final_settle() {
        let schedule = CapacitySchedule {
            sequence: CapacitySequence::new(vec![4, 8]).unwrap(),
            warmup: Duration::from_secs(2),
            hold: Duration::from_secs(5),
            settle: Duration::from_secs(1),
        };
        assert_eq!(schedule.planned_duration(), Duration::from_secs(13));

        let single = CapacitySchedule {
            sequence: CapacitySequence::new(vec![12]).unwrap(),
            ..schedule
        };
        assert_eq!(single.planned_duration(), Duration::from_secs(7));
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: CapacitySequence = serde_json::from_str("[4, 8, 12, 9, 4]").unwrap();
        assert_eq!(ok.len(), 5);
        assert!(serde_json::from_str::<CapacitySequence>("[]").is_err());
    }
}
