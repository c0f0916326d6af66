use std::path::PathBuf;
use std::time::Duration;

use bufbench_core::TestCase;

use crate::config::Config;
use crate::runner::{ProgressStream, WorkloadCommand, WorkloadLauncher};

/// Extra run time given to pgbench so the runner, not `-T`, ends the run.
const DURATION_MARGIN: Duration = Duration::from_secs(60);

/// Builds `pgbench` invocations for the measuring state.
#[derive(Debug, Clone)]
pub struct PgbenchLauncher {
    pgbench: PathBuf,
    host: String,
    port: u16,
    dbname: String,
    progress_interval_secs: u32,
}

impl PgbenchLauncher {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            pgbench: config.connection.tool("pgbench"),
            host: config.connection.host.clone(),
            port: config.connection.port,
            dbname: config.connection.dbname.clone(),
            progress_interval_secs: config.workload.progress_interval_secs,
        }
    }
}

impl WorkloadLauncher for PgbenchLauncher {
    fn command(&self, test_case: &TestCase, duration: Duration) -> WorkloadCommand {
        let run_secs = (duration + DURATION_MARGIN).as_secs_f64().ceil() as u64;

        let mut args = vec![
            "-P".to_string(),
            self.progress_interval_secs.to_string(),
            "-M".to_string(),
            test_case.query_mode.as_str().to_string(),
            "-h".to_string(),
            self.host.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-c".to_string(),
            test_case.clients.to_string(),
            "-j".to_string(),
            test_case.threads.to_string(),
        ];
        if let Some(scale) = test_case.scale_factor {
            args.extend(["-s".to_string(), scale.to_string()]);
        }
        if test_case.kind.is_read_only() {
            args.push("-S".to_string());
        }
        if let Some(script) = &test_case.script {
            args.extend(["-f".to_string(), script.display().to_string()]);
        }
        args.extend(["-T".to_string(), run_secs.to_string(), self.dbname.clone()]);

        WorkloadCommand {
            program: self.pgbench.clone(),
            args,
            progress: ProgressStream::Stderr,
        }
    }
}
