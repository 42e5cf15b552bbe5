// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster initializer strategies.
//!
//! Two primitives plus a combinator: fresh `initdb`, restore from an
//! archive, and an ordered sequence of either.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::{ExtractOptions, ExtractionStrategy};
use crate::cluster::DataCluster;
use crate::error::{Error, Result};

/// A strategy that brings a cluster's data directory into existence.
#[async_trait]
pub trait ClusterInitializer: Send + Sync {
    /// Wipe and re-create an already-initialized cluster instead of
    /// leaving it alone.
    fn force_reinitialization(&self) -> bool {
        false
    }

    /// Initialize the cluster. Implementations must be no-ops on an
    /// already-initialized cluster unless they force re-initialization.
    async fn initialize(&self, cluster: &DataCluster, cancel: &CancellationToken) -> Result<()>;
}

/// Fail unless the cluster is stopped.
async fn require_stopped(cluster: &DataCluster, cancel: &CancellationToken) -> Result<()> {
    if cluster.status(cancel).await?.is_valid() {
        return Err(Error::Validation(format!(
            "cluster {:?} must be stopped before initialization",
            cluster.id()
        )));
    }
    Ok(())
}

/// Fresh `initdb` initialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitDbInitializer {
    force: bool,
}

impl InitDbInitializer {
    /// Initialize only when the cluster is not yet initialized.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wipe an existing data directory first.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

#[async_trait]
impl ClusterInitializer for InitDbInitializer {
    fn force_reinitialization(&self) -> bool {
        self.force
    }

    async fn initialize(&self, cluster: &DataCluster, cancel: &CancellationToken) -> Result<()> {
        require_stopped(cluster, cancel).await?;
        if cluster.is_initialized().await? {
            if !self.force {
                debug!(cluster_id = %cluster.id(), "Already initialized, skipping initdb");
                return Ok(());
            }
            cluster
                .environment()
                .fs()
                .delete_directory(&cluster.data_path())
                .await?;
        }
        cluster
            .environment()
            .initdb()
            .initialize(cluster.config(), cancel)
            .await
    }
}

/// Initialization by extracting a previously archived data directory.
#[derive(Debug, Clone)]
pub struct ArchiveRestoreInitializer {
    archive_path: PathBuf,
    force: bool,
}

impl ArchiveRestoreInitializer {
    /// Restore from the archive at `archive_path`.
    pub fn new(archive_path: impl Into<PathBuf>) -> Self {
        Self {
            archive_path: archive_path.into(),
            force: false,
        }
    }

    /// Wipe an existing data directory first.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

#[async_trait]
impl ClusterInitializer for ArchiveRestoreInitializer {
    fn force_reinitialization(&self) -> bool {
        self.force
    }

    async fn initialize(&self, cluster: &DataCluster, cancel: &CancellationToken) -> Result<()> {
        let environment = cluster.environment();
        environment.fs().require_file(&self.archive_path).await?;
        require_stopped(cluster, cancel).await?;

        if cluster.is_initialized().await? {
            if !self.force {
                debug!(cluster_id = %cluster.id(), "Already initialized, skipping restore");
                return Ok(());
            }
            environment
                .fs()
                .delete_directory(&cluster.data_path())
                .await?;
        }

        let data_path = cluster.data_path();
        environment.fs().ensure_directory(&data_path).await?;
        environment
            .extractors()
            .for_strategy(ExtractionStrategy::default())
            .extract(&self.archive_path, &data_path, ExtractOptions::new(), cancel)
            .await?;
        info!(
            cluster_id = %cluster.id(),
            archive = %self.archive_path.display(),
            "Cluster restored from archive"
        );
        Ok(())
    }
}

/// Runs a sequence of strategies in order; the first failure aborts
/// the remainder.
#[derive(Clone, Default)]
pub struct CompoundInitializer {
    steps: Vec<Arc<dyn ClusterInitializer>>,
}

impl CompoundInitializer {
    /// An empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one strategy.
    pub fn then(mut self, step: Arc<dyn ClusterInitializer>) -> Self {
        self.steps.push(step);
        self
    }
}

#[async_trait]
impl ClusterInitializer for CompoundInitializer {
    fn force_reinitialization(&self) -> bool {
        self.steps.iter().any(|s| s.force_reinitialization())
    }

    async fn initialize(&self, cluster: &DataCluster, cancel: &CancellationToken) -> Result<()> {
        for step in &self.steps {
            step.initialize(cluster, cancel).await?;
        }
        Ok(())
    }
}
