// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Zip extraction strategy.

use std::fs::File;
use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

use super::{ArchiveEntry, ExtractOptions, Extractor, bail_if_cancelled, destination_key};
use crate::error::{Error, Result};

/// Plain zip reader. Directory entries are skipped; the directory tree
/// is implied by the file keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExtractor;

impl SystemExtractor {
    /// Create the strategy.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extractor for SystemExtractor {
    async fn enumerate(&self, source: &Path) -> Result<Vec<ArchiveEntry>> {
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || enumerate_zip(&source))
            .await
            .expect("zip enumerate task panicked")
    }

    async fn extract(
        &self,
        source: &Path,
        destination: &Path,
        options: ExtractOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = source.to_path_buf();
        let destination = destination.to_path_buf();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || extract_zip(&source, &destination, &options, &cancel))
            .await
            .expect("zip extract task panicked")
    }
}

pub(crate) fn enumerate_zip(source: &Path) -> Result<Vec<ArchiveEntry>> {
    let file = File::open(source).map_err(Error::fs("open archive", source))?;
    let mut archive = ZipArchive::new(file)?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        entries.push(ArchiveEntry {
            key: entry.name().to_string(),
            is_directory: entry.is_dir(),
            size: entry.size(),
        });
    }
    Ok(entries)
}

pub(crate) fn extract_zip(
    source: &Path,
    destination: &Path,
    options: &ExtractOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let file = File::open(source).map_err(Error::fs("open archive", source))?;
    let mut archive = ZipArchive::new(file)?;

    for index in 0..archive.len() {
        bail_if_cancelled(cancel)?;
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let described = ArchiveEntry {
            key: entry.name().to_string(),
            is_directory: false,
            size: entry.size(),
        };
        let Some(key) = destination_key(&described, options) else {
            continue;
        };
        let target = destination.join(&key);
        let mode = entry.unix_mode();
        write_entry(&mut entry, &target, described.size, mode)?;
    }
    Ok(())
}

fn write_entry(
    entry: &mut impl std::io::Read,
    target: &Path,
    size: u64,
    mode: Option<u32>,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(Error::fs("create directory", parent.to_path_buf()))?;
    }
    let mut out = File::create(target).map_err(Error::fs("create file", target))?;
    // Zero-sized entries are created by the touch above; streaming zero
    // bytes can hang on some archive backends.
    if size > 0 {
        std::io::copy(entry, &mut out).map_err(Error::fs("write file", target))?;
    }
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}
