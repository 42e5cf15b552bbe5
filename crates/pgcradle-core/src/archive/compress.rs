// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Zip compression of files and directory trees.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::bail_if_cancelled;
use crate::error::{Error, Result};

/// Predicate returning `true` for files that must be left out of the
/// archive. Receives the absolute path and its attributes.
pub type CompressExclude = Arc<dyn Fn(&Path, &std::fs::Metadata) -> bool + Send + Sync>;

/// Options applied while writing an archive.
#[derive(Clone, Default)]
pub struct CompressOptions {
    /// Name entries relative to the source's parent, so the archive
    /// contains the source directory itself as the root.
    pub include_root: bool,
    /// Files to leave out.
    pub exclude: Option<CompressExclude>,
}

impl CompressOptions {
    /// Options that archive the source's contents without the root.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the source directory as the archive root.
    pub fn include_root(mut self) -> Self {
        self.include_root = true;
        self
    }

    /// Leave out files matching the predicate.
    pub fn exclude(mut self, predicate: CompressExclude) -> Self {
        self.exclude = Some(predicate);
        self
    }
}

/// Writes zip archives from files or directory trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct Compressor;

impl Compressor {
    /// Create a compressor.
    pub fn new() -> Self {
        Self
    }

    /// Compress `source` (a file or a directory tree) into the zip
    /// archive at `archive_path`.
    pub async fn compress(
        &self,
        source: &Path,
        archive_path: &Path,
        options: CompressOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = source.to_path_buf();
        let archive_path = archive_path.to_path_buf();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            compress_blocking(&source, &archive_path, &options, &cancel)
        })
        .await
        .expect("compress task panicked")
    }
}

fn compress_blocking(
    source: &Path,
    archive_path: &Path,
    options: &CompressOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    if let Some(parent) = archive_path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::fs("create directory", parent.to_path_buf()))?;
    }
    let file = File::create(archive_path).map_err(Error::fs("create file", archive_path))?;
    let mut writer = ZipWriter::new(file);

    let meta = std::fs::metadata(source).map_err(Error::fs("probe", source))?;
    if meta.is_file() {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Validation(format!("{} has no file name", source.display())))?;
        add_file(&mut writer, source, &name, &meta)?;
    } else {
        let base: &Path = if options.include_root {
            source.parent().ok_or_else(|| {
                Error::Validation(format!(
                    "{} has no parent to name the archive root from",
                    source.display()
                ))
            })?
        } else {
            source
        };
        for entry in walkdir::WalkDir::new(source).min_depth(1).sort_by_file_name() {
            bail_if_cancelled(cancel)?;
            let entry =
                entry.map_err(|e| Error::Archive(format!("walking {}: {e}", source.display())))?;
            let relative = entry
                .path()
                .strip_prefix(base)
                .expect("walked entry is under the base");
            let key = zip_key(relative);
            let meta = entry.metadata().map_err(|e| {
                Error::Archive(format!("reading attributes of {}: {e}", entry.path().display()))
            })?;
            if meta.is_dir() {
                writer.add_directory(format!("{key}/"), entry_options(&meta))?;
            } else {
                if let Some(exclude) = &options.exclude
                    && exclude(entry.path(), &meta)
                {
                    continue;
                }
                add_file(&mut writer, entry.path(), &key, &meta)?;
            }
        }
    }

    writer.finish()?;
    Ok(())
}

fn add_file(
    writer: &mut ZipWriter<File>,
    path: &Path,
    key: &str,
    meta: &std::fs::Metadata,
) -> Result<()> {
    writer.start_file(key, entry_options(meta))?;
    let mut input = File::open(path).map_err(Error::fs("open file", path))?;
    std::io::copy(&mut input, writer).map_err(Error::fs("read file", path))?;
    Ok(())
}

#[cfg(unix)]
fn entry_options(meta: &std::fs::Metadata) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;
    SimpleFileOptions::default().unix_permissions(meta.permissions().mode())
}

#[cfg(not(unix))]
fn entry_options(_meta: &std::fs::Metadata) -> SimpleFileOptions {
    SimpleFileOptions::default()
}

fn zip_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
