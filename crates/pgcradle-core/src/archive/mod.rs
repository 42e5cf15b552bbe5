// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archive enumeration, extraction, and compression.
//!
//! Three pluggable extraction strategies, selected by name or by file
//! extension:
//!
//! | Strategy | Reader | Use |
//! |----------|--------|-----|
//! | `system` | zip only | plain zip bundles, jar unwrapping |
//! | `sharp`  | zip / tar / tar.gz / txz | general bundles (default) |
//! | `zonky`  | jar → system, enclosed txz → sharp | Maven-style jars |

mod compress;
mod sharp;
mod system;
mod zonky;

pub use compress::{CompressExclude, CompressOptions, Compressor};
pub use sharp::SharpExtractor;
pub use system::SystemExtractor;
pub use zonky::ZonkyExtractor;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// One entry inside an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Entry key using `/` separators, as stored in the archive.
    pub key: String,
    /// Whether the entry is a directory.
    pub is_directory: bool,
    /// Uncompressed size in bytes.
    pub size: u64,
}

/// Predicate returning `true` for entries that must be skipped. Applied
/// to the original key, before any root-segment handling.
pub type ExcludePredicate = Arc<dyn Fn(&ArchiveEntry) -> bool + Send + Sync>;

/// Options applied during extraction.
#[derive(Clone, Default)]
pub struct ExtractOptions {
    /// Entries to skip.
    pub exclude: Option<ExcludePredicate>,
    /// Drop the first path segment of every key.
    pub ignore_root_dir: bool,
}

impl ExtractOptions {
    /// Options that extract everything as-is.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the first path segment of every key.
    pub fn ignore_root_dir(mut self) -> Self {
        self.ignore_root_dir = true;
        self
    }

    /// Skip entries matching the predicate.
    pub fn exclude(mut self, predicate: ExcludePredicate) -> Self {
        self.exclude = Some(predicate);
        self
    }
}

/// An extraction strategy.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// List the archive's entries without writing anything.
    async fn enumerate(&self, source: &Path) -> Result<Vec<ArchiveEntry>>;

    /// Write the archive's entries under `destination`.
    async fn extract(
        &self,
        source: &Path,
        destination: &Path,
        options: ExtractOptions,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Extraction strategy names accepted from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ExtractionStrategy {
    /// Plain zip reader.
    System,
    /// Multi-format reader.
    #[default]
    Sharp,
    /// Jar wrapping a txz.
    Zonky,
}

/// Dispatches extraction strategies by name or by file extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractorFactory;

impl ExtractorFactory {
    /// Create a factory.
    pub fn new() -> Self {
        Self
    }

    /// Resolve a strategy by name.
    pub fn for_strategy(&self, strategy: ExtractionStrategy) -> Arc<dyn Extractor> {
        match strategy {
            ExtractionStrategy::System => Arc::new(SystemExtractor::new()),
            ExtractionStrategy::Sharp => Arc::new(SharpExtractor::new()),
            ExtractionStrategy::Zonky => Arc::new(ZonkyExtractor::new()),
        }
    }

    /// Resolve a strategy from a file's extension: `.jar` gets the zip
    /// reader, everything else the multi-format reader.
    pub fn for_file(&self, path: &Path) -> Arc<dyn Extractor> {
        let is_jar = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jar"));
        if is_jar {
            Arc::new(SystemExtractor::new())
        } else {
            Arc::new(SharpExtractor::new())
        }
    }
}

/// Apply exclusion and root-segment handling to an entry, returning the
/// on-disk relative key or `None` when the entry must be skipped.
pub(crate) fn destination_key(entry: &ArchiveEntry, options: &ExtractOptions) -> Option<String> {
    if let Some(exclude) = &options.exclude
        && exclude(entry)
    {
        return None;
    }
    let key = entry.key.trim_end_matches('/');
    if key.is_empty() || key.split('/').any(|segment| segment == "..") {
        return None;
    }
    if options.ignore_root_dir {
        let stripped = key.split_once('/').map(|(_, rest)| rest)?;
        if stripped.is_empty() {
            return None;
        }
        Some(stripped.to_string())
    } else {
        Some(key.to_string())
    }
}

/// Check cancellation from inside a blocking extraction loop.
pub(crate) fn bail_if_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}
