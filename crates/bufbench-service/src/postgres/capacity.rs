use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bufbench_core::{BenchError, BenchResult, CapacityChanger};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::psql::{run_tool, PsqlClient};
use crate::config::{Config, ResizeMode};

/// Changes `shared_buffers` on a running server.
///
/// In dynamic mode the new value is applied online by polling
/// `pg_resize_shared_buffers()`; in restart mode the server is restarted
/// with `pg_ctl`.
pub struct PostgresCapacity {
    psql: PsqlClient,
    database: String,
    mode: ResizeMode,
    poll_interval: Duration,
    timeout: Duration,
    pg_ctl: PathBuf,
    data_dir: PathBuf,
}

impl PostgresCapacity {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let connection = &config.connection;
        Self {
            psql: PsqlClient::new(connection),
            database: connection.maintenance_db.clone(),
            mode: config.resize.mode,
            poll_interval: Duration::from_secs(config.resize.poll_interval_secs),
            timeout: Duration::from_secs(config.resize.timeout_secs),
            pg_ctl: connection.tool("pg_ctl"),
            data_dir: connection.resolved_data_dir(),
        }
    }

    async fn resize_online(&self, target_gb: u32) -> BenchResult<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let done = self
                .psql
                .execute_with_timeout(&self.database, "SELECT pg_resize_shared_buffers()", self.timeout)
                .await
                .map_err(|e| BenchError::capacity(target_gb, e.to_string()))?;
            if done == "t" {
                return Ok(());
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(BenchError::capacity(
                    target_gb,
                    format!("resize not finished after {:?}", self.timeout),
                ));
            }
            debug!(target_gb, result = %done, "waiting for online resize");
            sleep(self.poll_interval).await;
        }
    }

    async fn restart(&self, target_gb: u32) -> BenchResult<()> {
        let args = vec![
            "-D".to_string(),
            self.data_dir.display().to_string(),
            "restart".to_string(),
            "-w".to_string(),
            "-l".to_string(),
            self.data_dir.join("logfile").display().to_string(),
        ];
        run_tool(&self.pg_ctl, &args, Some(self.timeout))
            .await
            .map_err(|e| BenchError::capacity(target_gb, e.to_string()))?;

        // pg_ctl -w returns once the server accepts connections; confirm anyway
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.psql.execute(&self.database, "SELECT 1").await {
                Ok(_) => return Ok(()),
                Err(e) if Instant::now() >= deadline => {
                    return Err(BenchError::capacity(target_gb, format!("server not back: {e}")));
                }
                Err(e) => debug!(error = %e, "waiting for server restart"),
            }
            sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl CapacityChanger for PostgresCapacity {
    async fn set_capacity(&self, target_gb: u32) -> BenchResult<()> {
        let sql = format!("ALTER SYSTEM SET shared_buffers = '{target_gb}GB'");
        self.psql
            .execute(&self.database, &sql)
            .await
            .map_err(|e| BenchError::capacity(target_gb, e.to_string()))?;

        if let Err(e) = self.psql.execute(&self.database, "SELECT pg_reload_conf()").await {
            warn!(target_gb, error = %e, "configuration reload failed");
        }

        match self.mode {
            ResizeMode::Dynamic => self.resize_online(target_gb).await,
            ResizeMode::Restart => {
                info!(target_gb, "restarting server to apply shared_buffers");
                self.restart(target_gb).await
            }
        }
    }

    async fn current_capacity(&self) -> BenchResult<u32> {
        let raw = self
            .psql
            .execute(&self.database, "SHOW shared_buffers")
            .await
            .map_err(|e| BenchError::Internal(format!("SHOW shared_buffers: {e}")))?;
        parse_shared_buffers_gb(&raw)
    }
}

/// Converts `SHOW shared_buffers` output (`4GB`, `512MB`, `8192kB`) to whole
/// gigabytes, rounding to the nearest.
pub fn parse_shared_buffers_gb(raw: &str) -> BenchResult<u32> {
    let value = raw.split_whitespace().next().unwrap_or_default();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let number: u64 = number
        .parse()
        .map_err(|_| BenchError::Internal(format!("unexpected shared_buffers value `{raw}`")))?;
    let kib = match unit {
        "TB" => number * 1024 * 1024 * 1024,
        "GB" => number * 1024 * 1024,
        "MB" => number * 1024,
        "kB" => number,
        // bare numbers are 8kB pages
        "" => number * 8,
        _ => {
            return Err(BenchError::Internal(format!(
                "unexpected shared_buffers unit in `{raw}`"
            )))
        }
    };

    const KIB_PER_GB: u64 = 1024 * 1024;
    u32::try_from((kib + KIB_PER_GB / 2) / KIB_PER_GB)
        .map_err(|_| BenchError::Internal(format!("shared_buffers `{raw}` out of range")))
}
