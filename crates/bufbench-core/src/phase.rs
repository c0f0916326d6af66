use std::time::Duration;

use crate::record::Phase;

/// Classifies a sample taken `elapsed` after the runner started.
///
/// Pure function of its arguments with a single transition at `warmup`.
/// Capacity changes never extend the warmup window.
#[must_use]
pub fn phase_at(elapsed: Duration, warmup: Duration) -> Phase {
    if elapsed < warmup {
        Phase::Warmup
    } else {
        Phase::Measurement
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_belongs_to_measurement() {
        let warmup = Duration::from_secs(3);
        assert_eq!(phase_at(Duration::ZERO, warmup), Phase::Warmup);
        assert_eq!(phase_at(Duration::from_millis(2999), warmup), Phase::Warmup);
        assert_eq!(phase_at(warmup, warmup), Phase::Measurement);
        assert_eq!(phase_at(Duration::from_secs(3600), warmup), Phase::Measurement);
    }

    #[test]
    fn test_zero_warmup_is_all_measurement() {
        assert_eq!(phase_at(Duration::ZERO, Duration::ZERO), Phase::Measurement);
    }

    #[test]
    fn test_single_monotonic_transition() {
        let warmup = Duration::from_millis(1_250);
        let phases: Vec<Phase> = (0..500)
            .map(|ms| phase_at(Duration::from_millis(ms * 10), warmup))
            .collect();

        let transitions = phases.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(transitions, 1);
        assert!(phases
            .windows(2)
            .all(|w| !(w[0] == Phase::Measurement && w[1] == Phase::Warmup)));
        assert_eq!(phases.iter().filter(|p| **p == Phase::Warmup).count(), 125);
    }
}
