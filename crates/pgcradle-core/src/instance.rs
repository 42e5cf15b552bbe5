// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance materialization.
//!
//! Lays the main engine bundle out under the instance directory and
//! overlays extension bundles, detecting whether an extension archive
//! wraps its payload in a single container directory.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::{ArchiveEntry, ExtractOptions, ExtractorFactory};
use crate::artifact::{Artifact, ArtifactBuilder, ArtifactKind};
use crate::error::{Error, Result};
use crate::fanout;
use crate::fs::FileSystem;
use crate::options::ServerOptions;

/// Concurrent extension extractions.
const EXTENSION_PARALLELISM: usize = 4;

/// Builds and destroys instance directories.
#[derive(Debug, Clone)]
pub struct InstanceBuilder {
    artifacts: ArtifactBuilder,
    fs: FileSystem,
    extractors: ExtractorFactory,
}

impl InstanceBuilder {
    /// Create a builder.
    pub fn new(artifacts: ArtifactBuilder, fs: FileSystem, extractors: ExtractorFactory) -> Self {
        Self {
            artifacts,
            fs,
            extractors,
        }
    }

    /// Materialize the artifacts and extract them into the instance
    /// directory described by `options`.
    pub async fn build(
        &self,
        options: &ServerOptions,
        artifacts: Vec<Artifact>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let artifacts = self.artifacts.build(artifacts, cancel).await?;
        let instance_dir = &options.instance.instance_directory;

        if options.clean_install {
            debug!(instance = %instance_dir.display(), "Clean install, removing instance tree");
            self.fs.delete_directory(instance_dir).await?;
        }
        self.fs.ensure_directory(instance_dir).await?;

        let main = artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Main)
            .expect("artifact set was validated");
        self.extract_main(main, instance_dir, options.exclude_pgadmin_installation, cancel)
            .await?;

        let extensions: Vec<Artifact> = artifacts
            .into_iter()
            .filter(|a| a.kind == ArtifactKind::Extension)
            .collect();
        if !extensions.is_empty() {
            let this = self.clone();
            let instance_dir = instance_dir.clone();
            let cancel = cancel.clone();
            let results = fanout::for_each(extensions, EXTENSION_PARALLELISM, move |artifact| {
                let this = this.clone();
                let instance_dir = instance_dir.clone();
                let cancel = cancel.clone();
                async move { this.extract_extension(&artifact, &instance_dir, &cancel).await }
            })
            .await;
            results.into_iter().collect::<Result<Vec<()>>>()?;
        }

        info!(instance = %instance_dir.display(), "Instance built");
        Ok(())
    }

    /// Delete the instance directory tree when present.
    pub async fn destroy(&self, options: &ServerOptions, _cancel: &CancellationToken) -> Result<()> {
        let instance_dir = &options.instance.instance_directory;
        self.fs.delete_directory(instance_dir).await?;
        info!(instance = %instance_dir.display(), "Instance destroyed");
        Ok(())
    }

    async fn extract_main(
        &self,
        main: &Artifact,
        instance_dir: &Path,
        exclude_pgadmin: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = main
            .local_path()
            .ok_or_else(|| Error::Validation(format!("{:?} was not materialized", main.source)))?;
        let extractor = self.extractors.for_strategy(main.strategy);

        let mut extract_options = ExtractOptions::new().ignore_root_dir();
        if exclude_pgadmin {
            extract_options = extract_options
                .exclude(Arc::new(|e: &ArchiveEntry| e.key.starts_with("pgsql/pgAdmin")));
        }
        extractor
            .extract(source, instance_dir, extract_options, cancel)
            .await
    }

    async fn extract_extension(
        &self,
        extension: &Artifact,
        instance_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = extension.local_path().ok_or_else(|| {
            Error::Validation(format!("{:?} was not materialized", extension.source))
        })?;
        let extractor = self.extractors.for_strategy(extension.strategy);

        let entries = extractor.enumerate(source).await?;
        let options = match container_root(&entries) {
            Some(container) => {
                debug!(
                    extension = %source.display(),
                    container = %container,
                    "Extension wraps a container root, dropping it"
                );
                let prefix = format!("{container}/");
                ExtractOptions::new()
                    .ignore_root_dir()
                    .exclude(Arc::new(move |e: &ArchiveEntry| !e.key.starts_with(&prefix)))
            }
            None => ExtractOptions::new(),
        };
        extractor.extract(source, instance_dir, options, cancel).await
    }
}

/// Find the single container directory wrapping an extension's payload:
/// the first segment of any entry whose key ends in `/bin/`, `/lib/`,
/// or `/share/`.
fn container_root(entries: &[ArchiveEntry]) -> Option<String> {
    entries
        .iter()
        .find(|e| {
            let key = e.key.trim_end_matches('/');
            key.contains('/')
                && ["bin", "lib", "share"]
                    .contains(&key.rsplit('/').next().unwrap_or_default())
                && e.is_directory
        })
        .and_then(|e| e.key.split('/').next())
        .map(str::to_string)
}
