use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bufbench_core::TestCaseKind;
use bufbench_service::postgres::{PgbenchLauncher, PostgresCapacity, PostgresProvisioner};
use bufbench_service::{Config, CsvOutput, Orchestrator, ResizeMode, ResultWriter};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line overrides for a benchmark run.
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub bin_dir: Option<PathBuf>,
    pub result_dir: Option<PathBuf>,
    pub vcore: Option<u32>,
    pub resize_mode: Option<ResizeMode>,
    pub test_cases: Vec<String>,
}

/// Loads configuration, runs every test case and writes the run report.
pub async fn run(options: RunOptions) -> Result<()> {
    let mut config =
        Config::load(options.config.as_deref()).context("failed to load configuration")?;
    apply_overrides(&mut config, &options)?;
    config.validate().context("invalid configuration")?;

    crate::init_logging(&config.logging);

    let run_dir = config
        .output
        .result_dir
        .join(format!("run_{}", Utc::now().format("%Y-%m-%d_%H%M%S")));
    let outputs = CsvOutput::create(&run_dir)
        .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;

    info!(
        host = %config.connection.host,
        port = config.connection.port,
        dbname = %config.connection.dbname,
        resize_mode = ?config.resize.mode,
        run_dir = %run_dir.display(),
        "starting bufbench"
    );

    let orchestrator = Orchestrator::new(
        config
            .orchestrator_config()
            .context("invalid orchestration settings")?,
        Arc::new(PostgresProvisioner::new(&config)),
        Arc::new(PostgresCapacity::new(&config)),
        Arc::new(PgbenchLauncher::new(&config)),
        Arc::new(outputs),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping current test case");
            on_signal.cancel();
        }
    });

    let report = orchestrator
        .run(&cancel)
        .await
        .context("benchmark run aborted")?;

    ResultWriter::new(&report)
        .write_all(&run_dir)
        .with_context(|| format!("failed to write run report to {}", run_dir.display()))?;

    info!(
        completed = report.completed(),
        failed = report.failed(),
        run_dir = %run_dir.display(),
        "run report written"
    );

    if !report.passes() {
        bail!(
            "{} of {} test cases did not complete; see {}",
            report.test_cases.len() - report.completed(),
            report.test_cases.len(),
            run_dir.display()
        );
    }
    Ok(())
}

fn apply_overrides(config: &mut Config, options: &RunOptions) -> Result<()> {
    if let Some(dir) = &options.bin_dir {
        config.connection.bin_dir = dir.clone();
    }
    if let Some(dir) = &options.result_dir {
        config.output.result_dir = dir.clone();
    }
    if let Some(vcore) = options.vcore {
        config.workload.settings.vcore = vcore;
    }
    if let Some(mode) = options.resize_mode {
        config.resize.mode = mode;
    }
    if !options.test_cases.is_empty() {
        config.workload.test_cases = options
            .test_cases
            .iter()
            .map(|label| label.parse::<TestCaseKind>().map_err(|e| anyhow!(e)))
            .collect::<Result<_>>()?;
    }
    Ok(())
}
