use std::time::Duration;

use thiserror::Error;

use crate::test_case::TestCaseKind;

/// Canonical error type for benchmark orchestration.
#[derive(Debug, Error)]
pub enum BenchError {
    /// A workload-generator progress line could not be parsed.
    #[error("unparsable progress line `{line}`: {reason}")]
    Parse {
        /// Offending line, trimmed.
        line: String,
        /// Which field failed and why.
        reason: String,
    },

    /// Dataset provisioning or teardown failed.
    #[error("dataset operation failed for {test_case}: {message}")]
    Dataset {
        /// Test case whose dataset was being prepared or dropped.
        test_case: TestCaseKind,
        /// Details reported by the provisioner.
        message: String,
    },

    /// The capacity-change operation failed.
    #[error("capacity change to {target_gb}GB failed: {message}")]
    Capacity {
        /// Requested capacity in GB.
        target_gb: u32,
        /// Details reported by the capacity changer.
        message: String,
    },

    /// The workload generator exited before its time budget elapsed.
    #[error("workload generator for {test_case} exited after {elapsed:?}: {status}")]
    WorkloadExited {
        /// Test case being measured.
        test_case: TestCaseKind,
        /// Time since the runner started.
        elapsed: Duration,
        /// Exit status description.
        status: String,
    },

    /// The workload generator could not be started.
    #[error("failed to spawn workload generator `{program}`: {source}")]
    WorkloadSpawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The database cannot be reached at all.
    #[error("database unreachable: {0}")]
    Unreachable(String),

    /// An output sink rejected a record.
    #[error("sink error: {0}")]
    Sink(String),

    /// I/O error occurred during file or process operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration rejected before the run started.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BenchError {
    /// Creates a `Parse` variant.
    #[must_use]
    pub fn parse(line: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            line: line.trim().to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a `Dataset` variant.
    #[must_use]
    pub fn dataset(test_case: TestCaseKind, message: impl Into<String>) -> Self {
        Self::Dataset {
            test_case,
            message: message.into(),
        }
    }

    /// Creates a `Capacity` variant.
    #[must_use]
    pub fn capacity(target_gb: u32, message: impl Into<String>) -> Self {
        Self::Capacity {
            target_gb,
            message: message.into(),
        }
    }

    /// Returns true when the error only affects the current test case.
    #[must_use]
    pub fn is_test_case_fatal(&self) -> bool {
        !matches!(self, Self::Unreachable(_) | Self::InvalidConfig(_))
    }
}

/// Convenient result alias for orchestration operations.
pub type BenchResult<T> = Result<T, BenchError>;
