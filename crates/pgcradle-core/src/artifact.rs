// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Binary bundle descriptors and their materialization.
//!
//! An artifact points at a bundle (a local file or an HTTP/HTTPS URL).
//! Building a set validates it eagerly, then fans out downloads so that
//! every artifact ends up local.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::archive::ExtractionStrategy;
use crate::download::HttpDownloader;
use crate::error::{Error, Result};
use crate::fanout;
use crate::fs::FileSystem;

/// Concurrent downloads during a build.
const DOWNLOAD_PARALLELISM: usize = 4;

/// What a bundle contributes to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// The engine itself; exactly one per build.
    Main,
    /// An extension laid over the engine tree.
    Extension,
}

/// An input descriptor for a binary bundle.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Main or extension.
    pub kind: ArtifactKind,
    /// Absolute file path or HTTP/HTTPS URL.
    pub source: String,
    /// Cache root for downloads.
    pub target_directory: PathBuf,
    /// Re-download even when cached.
    pub force: bool,
    /// Extraction strategy for this bundle.
    pub strategy: ExtractionStrategy,
}

impl Artifact {
    /// Describe the main engine bundle.
    pub fn main(source: impl Into<String>, target_directory: impl Into<PathBuf>) -> Self {
        Self {
            kind: ArtifactKind::Main,
            source: source.into(),
            target_directory: target_directory.into(),
            force: false,
            strategy: ExtractionStrategy::default(),
        }
    }

    /// Describe an extension bundle.
    pub fn extension(source: impl Into<String>, target_directory: impl Into<PathBuf>) -> Self {
        Self {
            kind: ArtifactKind::Extension,
            ..Self::main(source, target_directory)
        }
    }

    /// Set the extraction strategy.
    pub fn strategy(mut self, strategy: ExtractionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Re-download even when cached.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// True iff the source is a rooted path rather than a URL.
    pub fn is_local(&self) -> bool {
        let lowered = self.source.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            return false;
        }
        Path::new(&self.source).is_absolute()
    }

    /// The local path of a materialized artifact.
    pub fn local_path(&self) -> Option<&Path> {
        self.is_local().then(|| Path::new(self.source.as_str()))
    }
}

/// Check the artifact-set rules: exactly one main bundle, no two
/// artifacts sharing a source, and every source either local or HTTP.
pub fn validate_set(artifacts: &[Artifact]) -> Result<()> {
    let main_count = artifacts
        .iter()
        .filter(|a| a.kind == ArtifactKind::Main)
        .count();
    if main_count != 1 {
        return Err(Error::Validation(format!(
            "exactly one main artifact is required, found {main_count}"
        )));
    }
    let mut sources = std::collections::HashSet::new();
    for artifact in artifacts {
        if !sources.insert(artifact.source.as_str()) {
            return Err(Error::Validation(format!(
                "duplicate artifact source {:?}",
                artifact.source
            )));
        }
        let lowered = artifact.source.to_ascii_lowercase();
        let is_url = lowered.starts_with("http://") || lowered.starts_with("https://");
        if !is_url && !Path::new(&artifact.source).is_absolute() {
            return Err(Error::Validation(format!(
                "artifact source {:?} is neither an absolute path nor an HTTP(S) URL",
                artifact.source
            )));
        }
    }
    Ok(())
}

/// Materializes artifact sets into local files.
#[derive(Debug, Clone)]
pub struct ArtifactBuilder {
    downloader: HttpDownloader,
    fs: FileSystem,
}

impl ArtifactBuilder {
    /// Create a builder.
    pub fn new(downloader: HttpDownloader, fs: FileSystem) -> Self {
        Self { downloader, fs }
    }

    /// Validate the set and return it with every artifact local.
    ///
    /// Local artifacts must already exist; remote ones are downloaded
    /// into their cache directory with bounded parallelism. Validation
    /// failures surface before any network I/O.
    pub async fn build(
        &self,
        artifacts: Vec<Artifact>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Artifact>> {
        validate_set(&artifacts)?;
        for artifact in artifacts.iter().filter(|a| a.is_local()) {
            self.fs.require_file(Path::new(&artifact.source)).await?;
        }

        let downloader = Arc::new(self.downloader.clone());
        let cancel = cancel.clone();
        let results = fanout::for_each(artifacts, DOWNLOAD_PARALLELISM, move |artifact| {
            let downloader = downloader.clone();
            let cancel = cancel.clone();
            async move {
                if artifact.is_local() {
                    debug!(source = %artifact.source, "Artifact already local");
                    return Ok(artifact);
                }
                let path = downloader
                    .download(
                        &artifact.source,
                        &artifact.target_directory,
                        None,
                        artifact.force,
                        &cancel,
                    )
                    .await?;
                Ok(Artifact {
                    source: path.to_string_lossy().into_owned(),
                    ..artifact
                })
            }
        })
        .await;

        results.into_iter().collect()
    }
}
