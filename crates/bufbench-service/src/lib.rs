//! Orchestration engine for the bufbench resize benchmark.
//!
//! The [`Orchestrator`] runs each configured test case through
//! `Preparing → Measuring → Draining → Complete | Failed`. While measuring,
//! three workers share one budget:
//!
//! - [`WorkloadRunner`] streams workload-generator progress into metric samples
//! - [`ResourceSampler`] records host CPU on its own clock
//! - [`CapacityController`] walks the capacity sequence
//!
//! Records go to four append-only streams ([`sink`]). The PostgreSQL
//! implementations of the collaborator traits live in [`postgres`].

pub mod config;
pub mod controller;
pub mod orchestrator;
pub mod postgres;
pub mod report;
pub mod runner;
pub mod sampler;
pub mod sink;

pub use config::{Config, ConfigError, ResizeMode};
pub use controller::{
    CapacityController, ControllerOutcome, ControllerSettings, ControllerSinks, ControllerStatus,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, ProbeFactory};
pub use report::{ReportFormat, ResultWriter, RunReport, TestCaseReport, TestCaseState};
pub use runner::{
    ProgressStream, RunnerReport, RunnerSettings, RunnerSignals, RunnerStop, WorkloadCommand,
    WorkloadLauncher, WorkloadRunner,
};
pub use sampler::{ResourceSampler, SamplerStats, SysinfoCpuProbe};
pub use sink::{read_stream, CsvOutput, CsvSink, MemoryOutput, OutputStreams};
