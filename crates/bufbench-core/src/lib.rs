//! Core domain types and traits for the bufbench resize benchmark.

pub mod attribution;
pub mod capacity;
pub mod error;
pub mod phase;
pub mod progress;
pub mod record;
pub mod test_case;
pub mod traits;

pub use attribution::{attribute, capacity_at, capacity_windows, CapacityWindow};
pub use capacity::{CapacitySchedule, CapacitySequence};
pub use error::{BenchError, BenchResult};
pub use phase::phase_at;
pub use progress::ProgressLine;
pub use record::{
    CapacityChangeRecord, MetricSample, Phase, ResizeEvent, ResizeStatus, ResourceSample,
};
pub use test_case::{QueryMode, TestCase, TestCaseKind, WorkloadSettings};
pub use traits::{CapacityChanger, CpuProbe, DatasetProvisioner, RecordSink};
