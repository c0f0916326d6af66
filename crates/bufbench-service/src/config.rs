//! Configuration management for bufbench runs.
//!
//! Supports multiple configuration sources with precedence:
//! 1. Environment variables (highest priority)
//! 2. TOML configuration file
//! 3. Default values (lowest priority)
//!
//! The loaded value is validated once and then only read; components receive
//! the pieces they need through their constructors.

use bufbench_core::{
    CapacitySchedule, CapacitySequence, TestCase, TestCaseKind, WorkloadSettings,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::OrchestratorConfig;

/// Main configuration structure for a benchmark run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database server connection and tool locations
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Workload sizing and test case selection
    #[serde(default)]
    pub workload: WorkloadConfig,

    /// Warmup, hold and settle timing plus the capacity sequence
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// How capacity changes are applied
    #[serde(default)]
    pub resize: ResizeConfig,

    /// Resource sampler cadence
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Where record streams are written
    #[serde(default)]
    pub output: OutputConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database server connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server host (default: "localhost")
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port (default: 5432)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Benchmark database, recreated for every test case (default: "testdb")
    #[serde(default = "default_dbname")]
    pub dbname: String,

    /// Database used for create/drop statements (default: "postgres")
    #[serde(default = "default_maintenance_db")]
    pub maintenance_db: String,

    /// Directory containing `psql`, `pgbench` and `pg_ctl`
    #[serde(default)]
    pub bin_dir: PathBuf,

    /// Server data directory, needed for restart-mode resizes.
    /// Defaults to `<bin_dir>/../../test`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Timeout for a single SQL statement in seconds (default: 10)
    #[serde(default = "default_sql_timeout")]
    pub sql_timeout_secs: u64,
}

/// Workload generator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Host sizing inputs
    #[serde(flatten)]
    pub settings: WorkloadSettings,

    /// Progress report interval in seconds (default: 1)
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u32,

    /// Test cases to run, in order
    #[serde(default = "default_test_cases")]
    pub test_cases: Vec<TestCaseKind>,
}

/// Timing of each test case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Warmup before the first resize (default: 120)
    #[serde(default = "default_warmup")]
    pub warmup_secs: u64,

    /// Time each capacity stays in effect (default: 300)
    #[serde(default = "default_hold")]
    pub hold_secs: u64,

    /// Pause between a hold and the next resize (default: 600)
    #[serde(default = "default_settle")]
    pub settle_secs: u64,

    /// Capacity targets in GB (default: 4, 8, 12, 9, 4)
    #[serde(default = "default_capacity_sequence")]
    pub capacity_sequence_gb: Vec<u32>,

    /// Extra budget on top of the planned duration to absorb resize time (default: 600)
    #[serde(default = "default_overrun_allowance")]
    pub overrun_allowance_secs: u64,

    /// Backoff before retrying a failed resize (default: 2)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Grace period between the terminate signal and a forced kill (default: 5)
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_secs: u64,
}

/// How a new capacity is made effective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Reload the configuration and resize buffers online.
    #[default]
    Dynamic,
    /// Restart the server to pick up the new size.
    Restart,
}

/// Resize configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeConfig {
    /// Online resize or server restart (default: "dynamic")
    #[serde(default)]
    pub mode: ResizeMode,

    /// Poll interval while waiting for an online resize (default: 5)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Upper bound for one resize to complete (default: 600)
    #[serde(default = "default_resize_timeout")]
    pub timeout_secs: u64,
}

/// Resource sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Sampling period in milliseconds (default: 1000)
    #[serde(default = "default_sample_period")]
    pub period_ms: u64,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory under which each run creates its own folder (default: ".")
    #[serde(default = "default_result_dir")]
    pub result_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty (default: "pretty")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_dbname() -> String {
    "testdb".to_string()
}

fn default_maintenance_db() -> String {
    "postgres".to_string()
}

fn default_sql_timeout() -> u64 {
    10
}

fn default_progress_interval() -> u32 {
    1
}

fn default_test_cases() -> Vec<TestCaseKind> {
    vec![
        TestCaseKind::Select1,
        TestCaseKind::Select1Npps,
        TestCaseKind::ReadOnlyBorderline,
        TestCaseKind::ReadOnlyFullyCached,
        TestCaseKind::ReadWriteFullyCached,
    ]
}

fn default_warmup() -> u64 {
    120
}

fn default_hold() -> u64 {
    300
}

fn default_settle() -> u64 {
    600
}

fn default_capacity_sequence() -> Vec<u32> {
    vec![4, 8, 12, 9, 4]
}

fn default_overrun_allowance() -> u64 {
    600
}

fn default_retry_backoff() -> u64 {
    2
}

fn default_terminate_grace() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    5
}

fn default_resize_timeout() -> u64 {
    600
}

fn default_sample_period() -> u64 {
    1000
}

fn default_result_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dbname: default_dbname(),
            maintenance_db: default_maintenance_db(),
            bin_dir: PathBuf::new(),
            data_dir: None,
            sql_timeout_secs: default_sql_timeout(),
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            settings: WorkloadSettings::default(),
            progress_interval_secs: default_progress_interval(),
            test_cases: default_test_cases(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            warmup_secs: default_warmup(),
            hold_secs: default_hold(),
            settle_secs: default_settle(),
            capacity_sequence_gb: default_capacity_sequence(),
            overrun_allowance_secs: default_overrun_allowance(),
            retry_backoff_secs: default_retry_backoff(),
            terminate_grace_secs: default_terminate_grace(),
        }
    }
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            mode: ResizeMode::default(),
            poll_interval_secs: default_poll_interval(),
            timeout_secs: default_resize_timeout(),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            period_ms: default_sample_period(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            result_dir: default_result_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ConnectionConfig {
    /// Path of a server tool inside `bin_dir`.
    #[must_use]
    pub fn tool(&self, name: &str) -> PathBuf {
        self.bin_dir.join(name)
    }

    /// Data directory, derived from `bin_dir` when not set.
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            self.bin_dir
                .parent()
                .and_then(Path::parent)
                .map(|root| root.join("test"))
                .unwrap_or_else(|| PathBuf::from("test"))
        })
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file doesn't exist or has invalid TOML syntax.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::TomlError { path, source: e })
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Reads `path` when given, otherwise `bufbench.toml` if it exists,
    /// otherwise uses defaults. Environment variables override the result.
    ///
    /// Supported environment variables:
    /// - `BUFBENCH_HOST`, `BUFBENCH_PORT`, `BUFBENCH_DBNAME`
    /// - `BUFBENCH_BIN_DIR`, `BUFBENCH_DATA_DIR`, `BUFBENCH_RESULT_DIR`
    /// - `BUFBENCH_VCORE`, `BUFBENCH_RESIZE_MODE`
    /// - `BUFBENCH_LOG_LEVEL`, `BUFBENCH_LOG_FORMAT`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new("bufbench.toml").exists() => Self::from_file("bufbench.toml")?,
            None => Self::default(),
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("BUFBENCH_HOST") {
            self.connection.host = host;
        }

        if let Ok(port) = std::env::var("BUFBENCH_PORT") {
            if let Ok(port) = port.parse() {
                self.connection.port = port;
            }
        }

        if let Ok(dbname) = std::env::var("BUFBENCH_DBNAME") {
            self.connection.dbname = dbname;
        }

        if let Ok(dir) = std::env::var("BUFBENCH_BIN_DIR") {
            self.connection.bin_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("BUFBENCH_DATA_DIR") {
            self.connection.data_dir = Some(PathBuf::from(dir));
        }

        if let Ok(dir) = std::env::var("BUFBENCH_RESULT_DIR") {
            self.output.result_dir = PathBuf::from(dir);
        }

        if let Ok(vcore) = std::env::var("BUFBENCH_VCORE") {
            if let Ok(vcore) = vcore.parse() {
                self.workload.settings.vcore = vcore;
            }
        }

        if let Ok(mode) = std::env::var("BUFBENCH_RESIZE_MODE") {
            match mode.to_lowercase().as_str() {
                "dynamic" => self.resize.mode = ResizeMode::Dynamic,
                "restart" => self.resize.mode = ResizeMode::Restart,
                _ => {}
            }
        }

        if let Ok(level) = std::env::var("BUFBENCH_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = std::env::var("BUFBENCH_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.bin_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "connection.bin_dir must be set".to_string(),
            ));
        }

        if self.connection.dbname.is_empty() {
            return Err(ConfigError::ValidationError(
                "connection.dbname cannot be empty".to_string(),
            ));
        }

        if self.connection.dbname == self.connection.maintenance_db {
            return Err(ConfigError::ValidationError(
                "connection.dbname must differ from connection.maintenance_db".to_string(),
            ));
        }

        if self.connection.sql_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connection.sql_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.workload.settings.vcore == 0 {
            return Err(ConfigError::ValidationError(
                "workload.vcore must be > 0".to_string(),
            ));
        }

        if self.workload.progress_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "workload.progress_interval_secs must be > 0".to_string(),
            ));
        }

        if self.workload.test_cases.is_empty() {
            return Err(ConfigError::ValidationError(
                "workload.test_cases must list at least one test case".to_string(),
            ));
        }

        CapacitySequence::new(self.schedule.capacity_sequence_gb.clone())
            .map_err(|e| ConfigError::ValidationError(format!("schedule: {e}")))?;

        if self.schedule.hold_secs == 0 {
            return Err(ConfigError::ValidationError(
                "schedule.hold_secs must be > 0".to_string(),
            ));
        }

        if self.resize.poll_interval_secs == 0 || self.resize.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "resize.poll_interval_secs and resize.timeout_secs must be > 0".to_string(),
            ));
        }

        if self.sampler.period_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sampler.period_ms must be > 0".to_string(),
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        // Validate log format
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.format must be one of: {}",
                valid_formats.join(", ")
            )));
        }

        Ok(())
    }

    /// Resolves test cases and timings into the orchestrator's settings.
    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig, ConfigError> {
        let sequence = CapacitySequence::new(self.schedule.capacity_sequence_gb.clone())
            .map_err(|e| ConfigError::ValidationError(format!("schedule: {e}")))?;

        Ok(OrchestratorConfig {
            test_cases: self
                .workload
                .test_cases
                .iter()
                .map(|kind| TestCase::resolve(*kind, &self.workload.settings))
                .collect(),
            schedule: CapacitySchedule {
                sequence,
                warmup: Duration::from_secs(self.schedule.warmup_secs),
                hold: Duration::from_secs(self.schedule.hold_secs),
                settle: Duration::from_secs(self.schedule.settle_secs),
            },
            sample_period: Duration::from_millis(self.sampler.period_ms),
            overrun_allowance: Duration::from_secs(self.schedule.overrun_allowance_secs),
            retry_backoff: Duration::from_secs(self.schedule.retry_backoff_secs),
            terminate_grace: Duration::from_secs(self.schedule.terminate_grace_secs),
            relaunch_during_resize: self.resize.mode == ResizeMode::Restart,
        })
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file
    #[error("Failed to read config file {path:?}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("Failed to parse TOML in {path:?}: {source}")]
    TomlError {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Validation error
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
