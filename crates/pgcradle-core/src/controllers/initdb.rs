// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! initdb front-end.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Binding;
use crate::error::Result;
use crate::exec::{CommandExecutor, ExecSpec};
use crate::fs::{FileSystem, PathKind};
use crate::options::DataClusterConfiguration;

/// Creates data clusters via `initdb`.
#[derive(Debug, Clone)]
pub struct InitDbController {
    binding: Binding,
}

impl InitDbController {
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

    /// True iff the cluster's `PG_VERSION` file exists.
    pub async fn is_initialized(&self, cluster: &DataClusterConfiguration) -> Result<bool> {
        let marker = cluster
            .data_path(&self.binding.instance_directory)
            .join("PG_VERSION");
        Ok(self.binding.fs.path_kind(&marker).await? == PathKind::File)
    }

    /// Create the cluster's data directory; a no-op when already
    /// initialized.
    pub async fn initialize(
        &self,
        cluster: &DataClusterConfiguration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.is_initialized(cluster).await? {
            debug!(cluster_id = %cluster.unique_id, "Already initialized, skipping initdb");
            return Ok(());
        }
        let data_path = cluster.data_path(&self.binding.instance_directory);

        let mut spec = ExecSpec::new(&self.binding.binary)
            .arg("-U")
            .arg(&cluster.superuser)
            .arg("-D")
            .arg(data_path.to_string_lossy())
            .arg("-E")
            .arg(&cluster.encoding);
        if let Some(locale) = &cluster.locale {
            spec = spec.arg("--locale").arg(locale);
        }
        if cluster.allow_group_access == Some(true) {
            spec = spec.arg("--allow-group-access");
        }

        self.binding.executor.execute(spec, cancel).await?;
        info!(cluster_id = %cluster.unique_id, data = %data_path.display(), "Cluster initialized");
        Ok(())
    }
}
