// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pg_ctl front-end and postmaster.pid parsing.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Binding;
use crate::error::Result;
use crate::exec::{CommandExecutor, ExecSpec};
use crate::fs::{FileSystem, PathKind};
use crate::options::{DataClusterConfiguration, ShutdownParameters};

/// Runtime status probed from the cluster's `postmaster.pid`.
///
/// Status is valid iff `pid` is non-zero. An invalid status with a
/// non-zero `status_error` distinguishes "stopped" from a probe that
/// could not run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStatus {
    /// Postmaster process id; zero when not running.
    pub pid: u32,
    /// Data directory recorded by the postmaster.
    pub data_directory: PathBuf,
    /// Server start time, seconds since the epoch.
    pub start_time: i64,
    /// Port the postmaster bound.
    pub port: u16,
    /// Host or socket directory the postmaster bound.
    pub host: String,
    /// pg_ctl exit code when the probe reported not-running.
    pub status_error: i32,
}

impl RuntimeStatus {
    /// True when a running postmaster was observed.
    pub fn is_valid(&self) -> bool {
        self.pid != 0
    }

    fn stopped(status_error: i32) -> Self {
        Self {
            status_error,
            ..Self::default()
        }
    }

    /// Parse the first five lines of a `postmaster.pid` file:
    /// pid, data directory, start time, port, host. Later lines vary by
    /// engine version and are ignored.
    pub fn parse_postmaster_pid(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let pid = lines.next()?.trim().parse::<u32>().ok()?;
        let data_directory = PathBuf::from(lines.next()?.trim());
        let start_time = lines.next()?.trim().parse::<i64>().ok()?;
        let port = lines.next()?.trim().parse::<u16>().ok()?;
        let host = lines.next()?.trim().to_string();
        Some(Self {
            pid,
            data_directory,
            start_time,
            port,
            host,
            status_error: 0,
        })
    }
}

/// Drives a cluster's postmaster via `pg_ctl`.
#[derive(Debug, Clone)]
pub struct ClusterController {
    binding: Binding,
}

impl ClusterController {
    /// Bind the controller to an instance.
    pub fn new(
        binary: PathBuf,
        instance_directory: PathBuf,
        fs: FileSystem,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            binding: Binding::new(binary, instance_directory, fs, executor),
        }
    }

    fn data_path(&self, cluster: &DataClusterConfiguration) -> PathBuf {
        cluster.data_path(&self.binding.instance_directory)
    }

    /// Probe the cluster via `pg_ctl status` and the pid file.
    ///
    /// A non-zero exit is not an error here; it comes back as
    /// `status_error` on an invalid status.
    pub async fn get_status(
        &self,
        cluster: &DataClusterConfiguration,
        cancel: &CancellationToken,
    ) -> Result<RuntimeStatus> {
        let data_path = self.data_path(cluster);
        let spec = ExecSpec::new(&self.binding.binary)
            .arg("status")
            .arg("-D")
            .arg(data_path.to_string_lossy())
            .no_throw();
        let exit_code = self.binding.executor.execute(spec, cancel).await?;
        if exit_code != 0 {
            return Ok(RuntimeStatus::stopped(exit_code));
        }

        let pid_file = data_path.join("postmaster.pid");
        if self.binding.fs.path_kind(&pid_file).await? != PathKind::File {
            return Ok(RuntimeStatus::stopped(0));
        }
        let contents = tokio::fs::read_to_string(&pid_file)
            .await
            .map_err(crate::error::Error::fs("read file", &pid_file))?;
        Ok(RuntimeStatus::parse_postmaster_pid(&contents)
            .unwrap_or_else(|| RuntimeStatus::stopped(0)))
    }

    /// Start the postmaster.
    ///
    /// Output is never captured here: the postmaster hands its stdout
    /// to child backends, and holding the pipe open deadlocks the call.
    pub async fn start(
        &self,
        cluster: &DataClusterConfiguration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let data_path = self.data_path(cluster);
        let spec = ExecSpec::new(&self.binding.binary)
            .arg("start")
            .arg("-U")
            .arg(&cluster.superuser)
            .arg("-D")
            .arg(data_path.to_string_lossy())
            .arg("-o")
            .arg(postgres_options(cluster));
        self.binding.executor.execute(spec, cancel).await?;
        info!(cluster_id = %cluster.unique_id, port = cluster.port, "Postmaster started");
        Ok(())
    }

    /// Stop the postmaster with the requested shutdown mode.
    pub async fn stop(
        &self,
        cluster: &DataClusterConfiguration,
        shutdown: &ShutdownParameters,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = self.shutdown_spec("stop", cluster, shutdown);
        self.binding.executor.execute(spec, cancel).await?;
        info!(cluster_id = %cluster.unique_id, mode = %shutdown.mode, "Postmaster stopped");
        Ok(())
    }

    /// Restart the postmaster with the requested shutdown mode.
    pub async fn restart(
        &self,
        cluster: &DataClusterConfiguration,
        shutdown: &ShutdownParameters,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = self.shutdown_spec("restart", cluster, shutdown);
        self.binding.executor.execute(spec, cancel).await?;
        info!(cluster_id = %cluster.unique_id, "Postmaster restarted");
        Ok(())
    }

    /// Re-read the server configuration without a restart.
    pub async fn reload_configuration(
        &self,
        cluster: &DataClusterConfiguration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = ExecSpec::new(&self.binding.binary)
            .arg("reload")
            .arg("-U")
            .arg(&cluster.superuser)
            .arg("-D")
            .arg(self.data_path(cluster).to_string_lossy());
        self.binding.executor.execute(spec, cancel).await?;
        debug!(cluster_id = %cluster.unique_id, "Configuration reloaded");
        Ok(())
    }

    /// Stop the cluster when running, then delete its data directory.
    pub async fn destroy(
        &self,
        cluster: &DataClusterConfiguration,
        shutdown: &ShutdownParameters,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.get_status(cluster, cancel).await?.is_valid() {
            self.stop(cluster, shutdown, cancel).await?;
        }
        let data_path = self.data_path(cluster);
        if self.binding.fs.path_kind(&data_path).await? == PathKind::Directory {
            self.binding.fs.delete_directory(&data_path).await?;
        }
        info!(cluster_id = %cluster.unique_id, "Cluster destroyed");
        Ok(())
    }

    fn shutdown_spec(
        &self,
        subcommand: &str,
        cluster: &DataClusterConfiguration,
        shutdown: &ShutdownParameters,
    ) -> ExecSpec {
        ExecSpec::new(&self.binding.binary)
            .arg(subcommand)
            .arg("-U")
            .arg(&cluster.superuser)
            .arg("-D")
            .arg(self.data_path(cluster).to_string_lossy())
            .arg("-m")
            .arg(shutdown.mode.to_string())
            .arg(if shutdown.wait { "--wait" } else { "--no-wait" })
            .arg("-t")
            .arg(shutdown.timeout.as_secs().to_string())
    }
}

/// The `-o` payload handed to the postmaster: `-F` (no fsync), the
/// explicit port, then every cluster parameter in order.
fn postgres_options(cluster: &DataClusterConfiguration) -> String {
    let mut options = format!("-F -p {}", cluster.port);
    for (key, value) in &cluster.parameters {
        options.push_str(&format!(" -c {key}={value}"));
    }
    options
}
