// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration records for instances, clusters, and lifecycle calls.
//!
//! All types are plain value records with consuming builder methods;
//! [`ServerOptions::validate`] freezes a configuration by checking the
//! cross-cluster uniqueness rules.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Error, Result};

/// Default data directory, relative to the instance directory.
pub const DEFAULT_DATA_DIRECTORY: &str = "data";
/// Default superuser name.
pub const DEFAULT_SUPERUSER: &str = "postgres";
/// Default template database encoding.
pub const DEFAULT_ENCODING: &str = "UTF-8";
/// Default cluster host.
pub const DEFAULT_HOST: &str = "localhost";
/// Default startup readiness wait.
pub const DEFAULT_STARTUP_WAIT: Duration = Duration::from_secs(30);
/// Default shutdown wait.
pub const DEFAULT_SHUTDOWN_WAIT: Duration = Duration::from_secs(180);

/// Platform-specific fix-ups applied after extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformParameters {
    /// Reset file attributes to normal on every extracted entry.
    pub normalize_attributes: bool,
    /// Windows: grant the current user full control on the instance
    /// directory tree, once per instance.
    pub add_local_user_access_permission: bool,
    /// POSIX: set the executable bit on the required binaries.
    pub set_executable_attributes: bool,
}

/// Where and how an instance is laid out on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfiguration {
    /// Instance directory; unique per instance.
    pub instance_directory: PathBuf,
    /// Platform fix-ups.
    pub platform: PlatformParameters,
}

impl InstanceConfiguration {
    /// Describe an instance at `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            instance_directory: directory.into(),
            platform: PlatformParameters::default(),
        }
    }

    /// Set the platform fix-ups.
    pub fn platform(mut self, platform: PlatformParameters) -> Self {
        self.platform = platform;
        self
    }

    /// The `bin` directory holding the engine binaries.
    pub fn bin_directory(&self) -> PathBuf {
        self.instance_directory.join("bin")
    }
}

/// One data cluster inside an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataClusterConfiguration {
    /// Caller-chosen id, unique within the instance.
    pub unique_id: String,
    /// Data directory, relative to the instance directory.
    pub data_directory: PathBuf,
    /// Cluster superuser.
    pub superuser: String,
    /// Template database encoding.
    pub encoding: String,
    /// Locale passed to initdb, when set.
    pub locale: Option<String>,
    /// Tri-state group access: `Some(true)` emits the flag, anything
    /// else omits it.
    pub allow_group_access: Option<bool>,
    /// Host the postmaster binds.
    pub host: String,
    /// Port the postmaster binds; required, non-zero.
    pub port: u16,
    /// Server parameters passed as `-c key=value` at start, in order.
    pub parameters: Vec<(String, String)>,
}

impl DataClusterConfiguration {
    /// Describe a cluster with the given id and port; everything else
    /// takes its default.
    pub fn new(unique_id: impl Into<String>, port: u16) -> Self {
        Self {
            unique_id: unique_id.into(),
            data_directory: PathBuf::from(DEFAULT_DATA_DIRECTORY),
            superuser: DEFAULT_SUPERUSER.to_string(),
            encoding: DEFAULT_ENCODING.to_string(),
            locale: None,
            allow_group_access: None,
            host: DEFAULT_HOST.to_string(),
            port,
            parameters: Vec::new(),
        }
    }

    /// Set the data directory (relative to the instance directory).
    pub fn data_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.data_directory = directory.into();
        self
    }

    /// Set the superuser.
    pub fn superuser(mut self, superuser: impl Into<String>) -> Self {
        self.superuser = superuser.into();
        self
    }

    /// Set the encoding.
    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    /// Set the locale.
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// Set tri-state group access.
    pub fn allow_group_access(mut self, allow: bool) -> Self {
        self.allow_group_access = Some(allow);
        self
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Append one server parameter.
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }

    /// Absolute data directory under `instance_directory`.
    pub fn data_path(&self, instance_directory: &Path) -> PathBuf {
        instance_directory.join(&self.data_directory)
    }
}

/// Everything needed to build a server.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Instance layout.
    pub instance: InstanceConfiguration,
    /// Cluster set; at least one required.
    pub clusters: Vec<DataClusterConfiguration>,
    /// Delete and re-extract the instance directory before building.
    pub clean_install: bool,
    /// Skip `pgsql/pgAdmin*` entries of the main bundle.
    pub exclude_pgadmin_installation: bool,
}

impl Default for InstanceConfiguration {
    fn default() -> Self {
        Self::new("instance")
    }
}

impl ServerOptions {
    /// Describe a server over the given instance.
    pub fn new(instance: InstanceConfiguration) -> Self {
        Self {
            instance,
            clusters: Vec::new(),
            clean_install: false,
            exclude_pgadmin_installation: false,
        }
    }

    /// Add one cluster.
    pub fn cluster(mut self, cluster: DataClusterConfiguration) -> Self {
        self.clusters.push(cluster);
        self
    }

    /// Delete and re-extract the instance directory before building.
    pub fn clean_install(mut self) -> Self {
        self.clean_install = true;
        self
    }

    /// Skip the bundled pgAdmin installation.
    pub fn exclude_pgadmin_installation(mut self) -> Self {
        self.exclude_pgadmin_installation = true;
        self
    }

    /// Check the cross-cluster rules: at least one cluster, all ports
    /// non-zero, all ids distinct, all `(host, port, data_directory)`
    /// triples distinct.
    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            return Err(Error::Validation(
                "at least one data cluster is required".to_string(),
            ));
        }
        let mut ids = std::collections::HashSet::new();
        let mut triples = std::collections::HashSet::new();
        for cluster in &self.clusters {
            if cluster.port == 0 {
                return Err(Error::Validation(format!(
                    "cluster {:?} has port 0",
                    cluster.unique_id
                )));
            }
            if !ids.insert(cluster.unique_id.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate cluster id {:?}",
                    cluster.unique_id
                )));
            }
            let triple = (
                cluster.host.as_str(),
                cluster.port,
                cluster.data_directory.as_path(),
            );
            if !triples.insert(triple) {
                return Err(Error::Validation(format!(
                    "clusters share host {:?}, port {} and data directory {}",
                    cluster.host,
                    cluster.port,
                    cluster.data_directory.display()
                )));
            }
        }
        Ok(())
    }
}

/// Shutdown modes understood by pg_ctl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum ShutdownMode {
    /// Wait for clients to disconnect.
    Smart,
    /// Disconnect clients, flush, and shut down.
    #[default]
    Fast,
    /// Abort without a clean shutdown; recovery runs on next start.
    Immediate,
}

/// How a cluster is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownParameters {
    /// Shutdown mode.
    pub mode: ShutdownMode,
    /// Wait for the shutdown to complete.
    pub wait: bool,
    /// Wait limit handed to pg_ctl.
    pub timeout: Duration,
}

impl Default for ShutdownParameters {
    fn default() -> Self {
        Self {
            mode: ShutdownMode::Fast,
            wait: true,
            timeout: DEFAULT_SHUTDOWN_WAIT,
        }
    }
}

impl ShutdownParameters {
    /// Fast shutdown with the default wait.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mode.
    pub fn mode(mut self, mode: ShutdownMode) -> Self {
        self.mode = mode;
        self
    }

    /// Do not wait for completion.
    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }

    /// Set the wait limit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How a cluster is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupParameters {
    /// Poll a TCP connect to the cluster until it accepts.
    pub wait: bool,
    /// Give up after this long.
    pub wait_timeout: Duration,
}

impl Default for StartupParameters {
    fn default() -> Self {
        Self {
            wait: true,
            wait_timeout: DEFAULT_STARTUP_WAIT,
        }
    }
}

impl StartupParameters {
    /// Wait for readiness with the default timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return as soon as pg_ctl does.
    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }

    /// Set the readiness timeout.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}
