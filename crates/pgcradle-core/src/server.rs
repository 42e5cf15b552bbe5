// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Multi-cluster façade.
//!
//! Holds the environment and the cluster map, and fans lifecycle
//! operations out over a selected subset with bounded parallelism.
//! Per-cluster failures are captured into events and never abort
//! sibling clusters; ordering across clusters is unspecified.

use std::sync::Arc;

use strum::Display;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::DataCluster;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::fanout;
use crate::initializer::ClusterInitializer;
use crate::options::{DataClusterConfiguration, ShutdownParameters, StartupParameters};

/// The lifecycle operation an event reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ClusterOperation {
    /// Initializer strategy run.
    Initialize,
    /// Postmaster start.
    Start,
    /// Postmaster stop.
    Stop,
    /// Configuration reload.
    Reload,
}

/// Outcome of one cluster's share of a fan-out.
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    /// The cluster the event belongs to.
    pub cluster_id: String,
    /// The operation that ran.
    pub operation: ClusterOperation,
    /// The failure, when the operation did not succeed.
    pub error: Option<String>,
}

impl ClusterEvent {
    /// True when the operation succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Options for one fan-out call.
#[derive(Clone, Default)]
pub struct FanOutOptions {
    /// Concurrent clusters; zero and one both mean sequential.
    pub max_parallelism: usize,
    /// Live event stream; every selected cluster produces exactly one
    /// event, success or failure.
    pub events: Option<UnboundedSender<ClusterEvent>>,
}

impl FanOutOptions {
    /// Sequential fan-out without an event stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the parallelism bound.
    pub fn max_parallelism(mut self, degree: usize) -> Self {
        self.max_parallelism = degree;
        self
    }

    /// Stream events while the fan-out runs.
    pub fn events(mut self, sender: UnboundedSender<ClusterEvent>) -> Self {
        self.events = Some(sender);
        self
    }
}

/// The server: one environment, many clusters.
pub struct Server {
    environment: Arc<Environment>,
    clusters: Mutex<Vec<Arc<DataCluster>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("environment", &self.environment)
            .finish()
    }
}

impl Server {
    /// Create a server with an empty cluster map.
    pub fn new(environment: Arc<Environment>) -> Self {
        Self {
            environment,
            clusters: Mutex::new(Vec::new()),
        }
    }

    /// The environment behind this server.
    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    /// Add a cluster, enforcing the uniqueness rules against the
    /// clusters already present.
    pub async fn add_cluster(&self, config: DataClusterConfiguration) -> Result<Arc<DataCluster>> {
        if config.port == 0 {
            return Err(Error::Validation(format!(
                "cluster {:?} has port 0",
                config.unique_id
            )));
        }
        let mut clusters = self.clusters.lock().await;
        if clusters.iter().any(|c| c.id() == config.unique_id) {
            return Err(Error::Validation(format!(
                "duplicate cluster id {:?}",
                config.unique_id
            )));
        }
        if clusters.iter().any(|c| {
            let existing = c.config();
            existing.host == config.host
                && existing.port == config.port
                && existing.data_directory == config.data_directory
        }) {
            return Err(Error::Validation(format!(
                "a cluster with host {:?}, port {} and data directory {} already exists",
                config.host,
                config.port,
                config.data_directory.display()
            )));
        }
        let cluster = Arc::new(DataCluster::new(config, self.environment.clone()));
        clusters.push(cluster.clone());
        info!(cluster_id = %cluster.id(), "Cluster added");
        Ok(cluster)
    }

    /// Look a cluster up by id.
    pub async fn cluster(&self, unique_id: &str) -> Option<Arc<DataCluster>> {
        self.clusters
            .lock()
            .await
            .iter()
            .find(|c| c.id() == unique_id)
            .cloned()
    }

    /// Snapshot of all clusters, in insertion order.
    pub async fn clusters(&self) -> Vec<Arc<DataCluster>> {
        self.clusters.lock().await.clone()
    }

    /// Initialize the selected clusters (all when `ids` is empty).
    pub async fn initialize(
        &self,
        ids: &[&str],
        initializer: Arc<dyn ClusterInitializer>,
        options: &FanOutOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ClusterEvent>> {
        let selected = self.select(ids).await?;
        self.fan_out(selected, ClusterOperation::Initialize, options, cancel, {
            move |cluster, cancel| {
                let initializer = initializer.clone();
                async move { cluster.initialize(initializer.as_ref(), &cancel).await }
            }
        })
        .await
    }

    /// Start the selected clusters (all when `ids` is empty).
    pub async fn start(
        &self,
        ids: &[&str],
        params: StartupParameters,
        initializer: Option<Arc<dyn ClusterInitializer>>,
        options: &FanOutOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ClusterEvent>> {
        let selected = self.select(ids).await?;
        self.fan_out(selected, ClusterOperation::Start, options, cancel, {
            move |cluster, cancel| {
                let initializer = initializer.clone();
                async move {
                    cluster
                        .start(&params, initializer.as_deref(), &cancel)
                        .await
                }
            }
        })
        .await
    }

    /// Stop the selected clusters (all when `ids` is empty).
    pub async fn stop(
        &self,
        ids: &[&str],
        params: ShutdownParameters,
        options: &FanOutOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ClusterEvent>> {
        let selected = self.select(ids).await?;
        self.fan_out(selected, ClusterOperation::Stop, options, cancel, {
            move |cluster, cancel| async move { cluster.stop(&params, &cancel).await }
        })
        .await
    }

    /// Reload configuration on the selected clusters (all when `ids`
    /// is empty).
    pub async fn reload_configuration(
        &self,
        ids: &[&str],
        options: &FanOutOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ClusterEvent>> {
        let selected = self.select(ids).await?;
        self.fan_out(selected, ClusterOperation::Reload, options, cancel, {
            move |cluster, cancel| async move { cluster.reload_configuration(&cancel).await }
        })
        .await
    }

    /// Snapshot the selected clusters under the map lock. An unknown
    /// id is a validation failure; an empty selection means all.
    async fn select(&self, ids: &[&str]) -> Result<Vec<Arc<DataCluster>>> {
        let clusters = self.clusters.lock().await;
        if ids.is_empty() {
            return Ok(clusters.clone());
        }
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            let cluster = clusters
                .iter()
                .find(|c| c.id() == *id)
                .cloned()
                .ok_or_else(|| Error::Validation(format!("unknown cluster id {id:?}")))?;
            selected.push(cluster);
        }
        Ok(selected)
    }

    /// Run `work` over the clusters with bounded parallelism, capturing
    /// each outcome into a [`ClusterEvent`].
    async fn fan_out<F, Fut>(
        &self,
        clusters: Vec<Arc<DataCluster>>,
        operation: ClusterOperation,
        options: &FanOutOptions,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<Vec<ClusterEvent>>
    where
        F: Fn(Arc<DataCluster>, CancellationToken) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let events = options.events.clone();
        let cancel = cancel.clone();
        let collected = fanout::for_each(
            clusters,
            options.max_parallelism.max(1),
            move |cluster| {
                let work = work.clone();
                let events = events.clone();
                let cancel = cancel.clone();
                async move {
                    let outcome = work(cluster.clone(), cancel.clone()).await;
                    let event = ClusterEvent {
                        cluster_id: cluster.id().to_string(),
                        operation,
                        error: outcome.as_ref().err().map(ToString::to_string),
                    };
                    if let Some(error) = &event.error {
                        warn!(cluster_id = %event.cluster_id, %operation, error, "Cluster operation failed");
                    }
                    if let Some(sender) = &events {
                        let _ = sender.send(event.clone());
                    }
                    event
                }
            },
        )
        .await;
        Ok(collected)
    }
}
