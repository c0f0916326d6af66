//! Command-line tool invocation and the `psql` client built on it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ConnectionConfig;

/// Failure of an external tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} did not finish within {limit:?}")]
    Timeout { program: String, limit: Duration },

    #[error("{program} failed ({status}): {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Runs `program` to completion and returns its trimmed stdout.
///
/// The process is killed if `limit` elapses first.
pub async fn run_tool(
    program: &Path,
    args: &[String],
    limit: Option<Duration>,
) -> Result<String, ToolError> {
    let name = program.display().to_string();
    debug!(program = %name, ?args, "running tool");

    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
    let output = cmd.output();

    let output = match limit {
        Some(limit) => timeout(limit, output).await.map_err(|_| ToolError::Timeout {
            program: name.clone(),
            limit,
        })?,
        None => output.await,
    }
    .map_err(|source| ToolError::Spawn {
        program: name.clone(),
        source,
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(ToolError::Failed {
            program: name,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Runs single SQL statements through `psql` in tuples-only mode.
#[derive(Debug, Clone)]
pub struct PsqlClient {
    psql: PathBuf,
    host: String,
    port: u16,
    timeout: Duration,
}

impl PsqlClient {
    #[must_use]
    pub fn new(connection: &ConnectionConfig) -> Self {
        Self {
            psql: connection.tool("psql"),
            host: connection.host.clone(),
            port: connection.port,
            timeout: Duration::from_secs(connection.sql_timeout_secs),
        }
    }

    /// Executes `sql` against `database` with the default statement timeout.
    pub async fn execute(&self, database: &str, sql: &str) -> Result<String, ToolError> {
        self.execute_with_timeout(database, sql, self.timeout).await
    }

    pub async fn execute_with_timeout(
        &self,
        database: &str,
        sql: &str,
        limit: Duration,
    ) -> Result<String, ToolError> {
        run_tool(&self.psql, &self.args(database, sql), Some(limit)).await
    }

    fn args(&self, database: &str, sql: &str) -> Vec<String> {
        vec![
            "-h".to_string(),
            self.host.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-d".to_string(),
            database.to_string(),
            "-v".to_string(),
            "ON_ERROR_STOP=1".to_string(),
            "-t".to_string(),
            "-A".to_string(),
            "-c".to_string(),
            sql.to_string(),
        ]
    }
}

/// Quotes an SQL identifier.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes an SQL string literal.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
