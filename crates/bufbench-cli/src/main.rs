use std::path::PathBuf;

use anyhow::Result;
use bufbench_service::config::LoggingConfig;
use bufbench_service::ResizeMode;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

use commands::run::RunOptions;

#[derive(Parser, Debug)]
#[command(name = "bufbench")]
#[command(about = "Benchmark PostgreSQL throughput while shared_buffers is resized live", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every configured test case against the server
    Run {
        /// Configuration file (defaults to ./bufbench.toml when present)
        #[arg(long, env = "BUFBENCH_CONFIG")]
        config: Option<PathBuf>,

        /// Directory holding psql, pgbench and pg_ctl
        #[arg(long)]
        bin_dir: Option<PathBuf>,

        /// Directory under which the run directory is created
        #[arg(long)]
        result_dir: Option<PathBuf>,

        /// Virtual cores of the database host
        #[arg(long)]
        vcore: Option<u32>,

        /// How shared_buffers changes are applied
        #[arg(long, value_enum)]
        resize_mode: Option<ModeArg>,

        /// Run only these test cases (comma-separated labels)
        #[arg(long, value_delimiter = ',')]
        test_cases: Vec<String>,
    },

    /// Print per-capacity statistics for a finished run directory
    Summarize {
        /// Run directory containing the CSV streams
        dir: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Dynamic,
    Restart,
}

impl From<ModeArg> for ResizeMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Dynamic => ResizeMode::Dynamic,
            ModeArg::Restart => ResizeMode::Restart,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            bin_dir,
            result_dir,
            vcore,
            resize_mode,
            test_cases,
        } => {
            commands::run::run(RunOptions {
                config,
                bin_dir,
                result_dir,
                vcore,
                resize_mode: resize_mode.map(Into::into),
                test_cases,
            })
            .await
        }
        Command::Summarize { dir } => {
            init_logging(&LoggingConfig::default());
            commands::summarize::summarize(&dir)
        }
    }
}

/// Installs the global subscriber; `RUST_LOG` takes precedence over the
/// configured level.
pub(crate) fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let subscriber = fmt().with_env_filter(filter).with_target(false);

    if logging.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
