use std::path::PathBuf;

use async_trait::async_trait;
use bufbench_core::{BenchError, BenchResult, DatasetProvisioner, TestCase, WorkloadSettings};
use tracing::{info, warn};

use super::psql::{quote_ident, quote_literal, run_tool, PsqlClient};
use crate::config::Config;

/// Recreates the benchmark database and loads it with `pgbench -i`.
pub struct PostgresProvisioner {
    psql: PsqlClient,
    pgbench: PathBuf,
    host: String,
    port: u16,
    dbname: String,
    maintenance_db: String,
    settings: WorkloadSettings,
}

impl PostgresProvisioner {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let connection = &config.connection;
        Self {
            psql: PsqlClient::new(connection),
            pgbench: connection.tool("pgbench"),
            host: connection.host.clone(),
            port: connection.port,
            dbname: connection.dbname.clone(),
            maintenance_db: connection.maintenance_db.clone(),
            settings: config.workload.settings.clone(),
        }
    }

    fn init_args(&self, test_case: &TestCase) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            "-h".to_string(),
            self.host.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-s".to_string(),
            test_case.dataset_scale(&self.settings).to_string(),
        ];
        if test_case.kind.is_read_write() {
            args.extend(["-F".to_string(), "90".to_string()]);
        }
        args.push(self.dbname.clone());
        args
    }

    async fn terminate_backends(&self) {
        let sql = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = {} AND pid <> pg_backend_pid()",
            quote_literal(&self.dbname)
        );
        if let Err(e) = self.psql.execute(&self.maintenance_db, &sql).await {
            warn!(error = %e, "failed to terminate backends");
        }
    }

    async fn drop_database(&self) -> Result<(), String> {
        self.terminate_backends().await;
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(&self.dbname));
        self.psql
            .execute(&self.maintenance_db, &sql)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl DatasetProvisioner for PostgresProvisioner {
    async fn ping(&self) -> BenchResult<()> {
        self.psql
            .execute(&self.maintenance_db, "SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| BenchError::Unreachable(e.to_string()))
    }

    async fn create_dataset(&self, test_case: &TestCase) -> BenchResult<()> {
        let scale = test_case.dataset_scale(&self.settings);
        info!(dbname = %self.dbname, scale, "preparing clean database");

        if let Err(e) = self.drop_database().await {
            warn!(error = %e, "could not drop existing database");
        }

        let sql = format!("CREATE DATABASE {}", quote_ident(&self.dbname));
        self.psql
            .execute(&self.maintenance_db, &sql)
            .await
            .map_err(|e| BenchError::dataset(test_case.kind, format!("create database: {e}")))?;

        run_tool(&self.pgbench, &self.init_args(test_case), None)
            .await
            .map_err(|e| BenchError::dataset(test_case.kind, format!("pgbench init: {e}")))?;

        // start measuring from a clean checkpoint
        if let Err(e) = self.psql.execute(&self.dbname, "CHECKPOINT").await {
            warn!(error = %e, "checkpoint after initialisation failed");
        }

        info!(dbname = %self.dbname, scale, "dataset ready");
        Ok(())
    }

    async fn drop_dataset(&self, test_case: &TestCase) -> BenchResult<()> {
        info!(dbname = %self.dbname, "dropping database");
        self.drop_database()
            .await
            .map_err(|e| BenchError::dataset(test_case.kind, format!("drop database: {e}")))
    }
}
