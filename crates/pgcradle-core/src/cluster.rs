// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-cluster lifecycle.
//!
//! A cluster's state lives on disk: `PG_VERSION` marks it initialized,
//! a valid `postmaster.pid` probe marks it running. Operations are
//! idempotent where the contract says so (`start` when running and
//! `stop` when stopped are no-ops).
//!
//! ```text
//! Uninitialized ──initialize──▶ Initialized ──start──▶ Running
//!                                   ▲                    │
//!                                   └───────stop─────────┘
//!                              (destroy deletes the data directory)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::CompressOptions;
use crate::controllers::{
    DatabaseRowHandler, DumpOptions, OutputFormat, RestoreOptions, RuntimeStatus,
};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::exec::LineHandler;
use crate::initializer::ClusterInitializer;
use crate::options::{DataClusterConfiguration, ShutdownParameters, StartupParameters};

/// Interval between TCP readiness probes.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One data cluster bound to its environment.
#[derive(Debug, Clone)]
pub struct DataCluster {
    config: DataClusterConfiguration,
    environment: Arc<Environment>,
}

impl DataCluster {
    /// Bind a cluster configuration to an environment.
    pub fn new(config: DataClusterConfiguration, environment: Arc<Environment>) -> Self {
        Self {
            config,
            environment,
        }
    }

    /// The cluster configuration.
    pub fn config(&self) -> &DataClusterConfiguration {
        &self.config
    }

    /// The caller-chosen unique id.
    pub fn id(&self) -> &str {
        &self.config.unique_id
    }

    /// The environment this cluster runs in.
    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    /// Absolute path of the cluster's data directory.
    pub fn data_path(&self) -> PathBuf {
        self.config
            .data_path(self.environment.instance_directory())
    }

    /// Probe the cluster's runtime status.
    pub async fn status(&self, cancel: &CancellationToken) -> Result<RuntimeStatus> {
        self.environment
            .cluster_controller()
            .get_status(&self.config, cancel)
            .await
    }

    /// True iff the cluster's data directory has been initialized.
    pub async fn is_initialized(&self) -> Result<bool> {
        self.environment.initdb().is_initialized(&self.config).await
    }

    /// Run an initializer strategy. The cluster must not be running;
    /// strategies decide themselves whether an initialized cluster is
    /// re-initialized or left alone.
    pub async fn initialize(
        &self,
        initializer: &dyn ClusterInitializer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.status(cancel).await?.is_valid() {
            return Err(Error::Validation(format!(
                "cluster {:?} is running; stop it before initializing",
                self.id()
            )));
        }
        initializer.initialize(self, cancel).await
    }

    /// Start the cluster; a no-op when already running.
    ///
    /// An uninitialized cluster requires `initializer` and runs it
    /// first. With `params.wait`, a TCP connect to the cluster's
    /// host/port is polled until it succeeds or the timeout expires.
    pub async fn start(
        &self,
        params: &StartupParameters,
        initializer: Option<&dyn ClusterInitializer>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.status(cancel).await?.is_valid() {
            debug!(cluster_id = %self.id(), "Already running, start is a no-op");
            return Ok(());
        }
        if !self.is_initialized().await? {
            let initializer = initializer.ok_or_else(|| {
                Error::Validation(format!(
                    "cluster {:?} is not initialized and no initializer was provided",
                    self.id()
                ))
            })?;
            initializer.initialize(self, cancel).await?;
        }
        self.environment
            .cluster_controller()
            .start(&self.config, cancel)
            .await?;
        if params.wait {
            self.wait_until_ready(params.wait_timeout, cancel).await?;
        }
        Ok(())
    }

    /// Stop the cluster; a no-op when not running.
    pub async fn stop(
        &self,
        shutdown: &ShutdownParameters,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.status(cancel).await?.is_valid() {
            debug!(cluster_id = %self.id(), "Not running, stop is a no-op");
            return Ok(());
        }
        self.environment
            .cluster_controller()
            .stop(&self.config, shutdown, cancel)
            .await
    }

    /// Re-read the server configuration without a restart.
    pub async fn reload_configuration(&self, cancel: &CancellationToken) -> Result<()> {
        self.environment
            .cluster_controller()
            .reload_configuration(&self.config, cancel)
            .await
    }

    /// Stop the cluster when running, then compress its data directory
    /// into `archive_path` (contents only, no root directory).
    pub async fn archive(
        &self,
        archive_path: &Path,
        shutdown: &ShutdownParameters,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.stop(shutdown, cancel).await?;
        let data_path = self.data_path();
        self.environment.fs().require_directory(&data_path).await?;
        self.environment
            .compressor()
            .compress(&data_path, archive_path, CompressOptions::new(), cancel)
            .await?;
        info!(cluster_id = %self.id(), archive = %archive_path.display(), "Cluster archived");
        Ok(())
    }

    /// Stop the cluster when running and delete its data directory.
    pub async fn destroy(
        &self,
        shutdown: &ShutdownParameters,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.environment
            .cluster_controller()
            .destroy(&self.config, shutdown, cancel)
            .await
    }

    /// List databases, invoking `on_row` per record. Requires a
    /// running cluster and the SQL capability.
    pub async fn list_databases(
        &self,
        on_row: DatabaseRowHandler,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let sql = self.environment.sql()?;
        self.require_running(cancel).await?;
        sql.list_databases(&self.config, on_row, cancel).await
    }

    /// Execute a SQL string. Requires a running cluster and the SQL
    /// capability.
    pub async fn execute_sql(
        &self,
        sql: &str,
        database: Option<&str>,
        user: Option<&str>,
        on_output: Option<LineHandler>,
        format: &OutputFormat,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let controller = self.environment.sql()?;
        self.require_running(cancel).await?;
        controller
            .execute_sql(&self.config, sql, database, user, on_output, format, cancel)
            .await
    }

    /// Execute a SQL script file. Requires a running cluster and the
    /// SQL capability.
    pub async fn execute_file(
        &self,
        script: &Path,
        database: Option<&str>,
        user: Option<&str>,
        on_output: Option<LineHandler>,
        format: &OutputFormat,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let controller = self.environment.sql()?;
        self.require_running(cancel).await?;
        controller
            .execute_file(&self.config, script, database, user, on_output, format, cancel)
            .await
    }

    /// Export a database. Requires a running cluster and the dump
    /// capability.
    pub async fn export_dump(
        &self,
        options: &DumpOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let controller = self.environment.dump()?;
        self.require_running(cancel).await?;
        controller.dump(&self.config, options, cancel).await
    }

    /// Import a dump archive. Requires a running cluster and the
    /// restore capability.
    pub async fn import_dump(
        &self,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let controller = self.environment.restore()?;
        self.require_running(cancel).await?;
        controller.restore(&self.config, options, cancel).await
    }

    async fn require_running(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.status(cancel).await?.is_valid() {
            return Err(Error::Validation(format!(
                "cluster {:?} is not running",
                self.id()
            )));
        }
        Ok(())
    }

    /// Poll a TCP connect to the cluster until it accepts.
    async fn wait_until_ready(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "cluster {:?} to accept connections on {address}",
                    self.id()
                )));
            }
            match tokio::net::TcpStream::connect(&address).await {
                Ok(_) => {
                    debug!(cluster_id = %self.id(), %address, "Cluster accepts connections");
                    return Ok(());
                }
                Err(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockResponse;
    use crate::initializer::InitDbInitializer;
    use crate::test_support::{minimal_environment, running_pid_file, standard_environment};

    fn cluster_on(env: &crate::test_support::TestEnvironment) -> DataCluster {
        DataCluster::new(
            DataClusterConfiguration::new("primary", 5561),
            env.environment.clone(),
        )
    }

    #[tokio::test]
    async fn start_is_a_no_op_when_running() {
        let env = standard_environment().await;
        let cluster = cluster_on(&env);
        running_pid_file(&env, cluster.config(), 5561);

        cluster
            .start(&StartupParameters::new(), None, &CancellationToken::new())
            .await
            .unwrap();

        let recorded = env.mock.recorded_for("pg_ctl");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].args[0], "status");
    }

    #[tokio::test]
    async fn start_uninitialized_without_initializer_fails() {
        let env = standard_environment().await;
        env.mock.enqueue("pg_ctl", MockResponse::exit(3));
        let cluster = cluster_on(&env);

        let err = cluster
            .start(&StartupParameters::new(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn start_runs_the_initializer_then_pg_ctl() {
        let env = standard_environment().await;
        env.mock.enqueue("pg_ctl", MockResponse::exit(3));
        let cluster = cluster_on(&env);

        let initializer = InitDbInitializer::new();
        cluster
            .start(
                &StartupParameters::new().no_wait(),
                Some(&initializer),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(env.mock.recorded_for("initdb").len(), 1);
        let pg_ctl = env.mock.recorded_for("pg_ctl");
        assert_eq!(pg_ctl.last().unwrap().args[0], "start");
    }

    #[tokio::test]
    async fn start_wait_polls_until_the_port_accepts() {
        let env = standard_environment().await;
        env.mock.enqueue("pg_ctl", MockResponse::exit(3));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = DataClusterConfiguration::new("primary", port).host("127.0.0.1");
        crate::test_support::seed_initialized(&env, &config);
        let cluster = DataCluster::new(config, env.environment.clone());

        cluster
            .start(
                &StartupParameters::new().wait_timeout(Duration::from_secs(5)),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn start_wait_times_out_when_nothing_listens() {
        let env = standard_environment().await;
        env.mock.enqueue("pg_ctl", MockResponse::exit(3));
        let config = DataClusterConfiguration::new("primary", 1).host("127.0.0.1");
        crate::test_support::seed_initialized(&env, &config);
        let cluster = DataCluster::new(config, env.environment.clone());

        let err = cluster
            .start(
                &StartupParameters::new().wait_timeout(Duration::from_millis(300)),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn stop_is_a_no_op_when_stopped() {
        let env = standard_environment().await;
        env.mock.enqueue("pg_ctl", MockResponse::exit(3));
        let cluster = cluster_on(&env);

        cluster
            .stop(&ShutdownParameters::new(), &CancellationToken::new())
            .await
            .unwrap();

        let recorded = env.mock.recorded_for("pg_ctl");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].args[0], "status");
    }

    #[tokio::test]
    async fn initialize_rejects_a_running_cluster() {
        let env = standard_environment().await;
        let cluster = cluster_on(&env);
        running_pid_file(&env, cluster.config(), 5561);

        let initializer = InitDbInitializer::new();
        let err = cluster
            .initialize(&initializer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn archive_stops_and_compresses_without_the_root() {
        let env = standard_environment().await;
        env.mock.enqueue("pg_ctl", MockResponse::exit(3));
        let cluster = cluster_on(&env);
        crate::test_support::seed_initialized(&env, cluster.config());

        let archive = env.temp.path().join("backup.zip");
        cluster
            .archive(&archive, &ShutdownParameters::new(), &CancellationToken::new())
            .await
            .unwrap();

        use crate::archive::Extractor;
        let entries = crate::archive::SystemExtractor::new()
            .enumerate(&archive)
            .await
            .unwrap();
        assert!(entries.iter().any(|e| e.key == "PG_VERSION"));
        assert!(!entries.iter().any(|e| e.key.starts_with("data/")));
    }

    #[tokio::test]
    async fn sql_operations_fail_in_minimal_mode() {
        let env = minimal_environment().await;
        let cluster = cluster_on(&env);
        running_pid_file(&env, cluster.config(), 5561);

        let err = cluster
            .list_databases(Arc::new(|_| {}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingCapability("psql")));

        let err = cluster
            .execute_sql(
                "SELECT 1",
                None,
                None,
                None,
                &OutputFormat::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingCapability("psql")));
    }

    #[tokio::test]
    async fn sql_requires_a_running_cluster() {
        let env = standard_environment().await;
        env.mock.enqueue("pg_ctl", MockResponse::exit(3));
        let cluster = cluster_on(&env);

        let err = cluster
            .execute_sql(
                "SELECT 1",
                None,
                None,
                None,
                &OutputFormat::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(env.mock.recorded_for("psql").is_empty());
    }

    #[tokio::test]
    async fn destroy_deletes_the_data_directory() {
        let env = standard_environment().await;
        env.mock.enqueue("pg_ctl", MockResponse::exit(3));
        let cluster = cluster_on(&env);
        crate::test_support::seed_initialized(&env, cluster.config());
        assert!(cluster.data_path().exists());

        cluster
            .destroy(&ShutdownParameters::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!cluster.data_path().exists());
    }
}
