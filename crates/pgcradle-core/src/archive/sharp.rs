// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Multi-format extraction strategy.
//!
//! Reads zip, tar, tar.gz, and txz archives. Symbolic-link entries are
//! not recreated as links: the link targets are recorded during the
//! first pass and materialized afterwards by copying the referenced
//! file or directory, so bundles extract on platforms without symlink
//! permissions.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use xz2::read::XzDecoder;

use super::system::{enumerate_zip, extract_zip};
use super::{ArchiveEntry, ExtractOptions, Extractor, bail_if_cancelled, destination_key};
use crate::error::{Error, Result};

/// General multi-format reader; the default strategy.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharpExtractor;

impl SharpExtractor {
    /// Create the strategy.
    pub fn new() -> Self {
        Self
    }
}

enum Format {
    Zip,
    Tar(Compression),
}

enum Compression {
    None,
    Gzip,
    Xz,
}

fn detect_format(source: &Path) -> Result<Format> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".zip") || name.ends_with(".jar") {
        Ok(Format::Zip)
    } else if name.ends_with(".tar") {
        Ok(Format::Tar(Compression::None))
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(Format::Tar(Compression::Gzip))
    } else if name.ends_with(".txz") || name.ends_with(".tar.xz") {
        Ok(Format::Tar(Compression::Xz))
    } else {
        Err(Error::Archive(format!(
            "unsupported archive format: {}",
            source.display()
        )))
    }
}

fn open_tar(source: &Path, compression: &Compression) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(source).map_err(Error::fs("open archive", source))?;
    let reader: Box<dyn Read> = match compression {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(GzDecoder::new(file)),
        Compression::Xz => Box::new(XzDecoder::new(file)),
    };
    Ok(tar::Archive::new(reader))
}

#[async_trait]
impl Extractor for SharpExtractor {
    async fn enumerate(&self, source: &Path) -> Result<Vec<ArchiveEntry>> {
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || match detect_format(&source)? {
            Format::Zip => enumerate_zip(&source),
            Format::Tar(compression) => enumerate_tar(&source, &compression),
        })
        .await
        .expect("archive enumerate task panicked")
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
        tokio::task::spawn_blocking(move || match detect_format(&source)? {
            Format::Zip => extract_zip(&source, &destination, &options, &cancel),
            Format::Tar(compression) => {
                extract_tar(&source, &compression, &destination, &options, &cancel)
            }
        })
        .await
        .expect("archive extract task panicked")
    }
}

fn enumerate_tar(source: &Path, compression: &Compression) -> Result<Vec<ArchiveEntry>> {
    let mut archive = open_tar(source, compression)?;
    let mut entries = Vec::new();
    for entry in archive.entries().map_err(Error::fs("read archive", source))? {
        let entry = entry.map_err(Error::fs("read archive", source))?;
        let key = entry
            .path()
            .map_err(Error::fs("read archive", source))?
            .to_string_lossy()
            .into_owned();
        entries.push(ArchiveEntry {
            key,
            is_directory: entry.header().entry_type().is_dir(),
            size: entry.header().size().unwrap_or(0),
        });
    }
    Ok(entries)
}

fn extract_tar(
    source: &Path,
    compression: &Compression,
    destination: &Path,
    options: &ExtractOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut archive = open_tar(source, compression)?;
    // link key -> link target, materialized by copy after the first pass
    let mut links: Vec<(String, PathBuf)> = Vec::new();

    for entry in archive.entries().map_err(Error::fs("read archive", source))? {
        bail_if_cancelled(cancel)?;
        let mut entry = entry.map_err(Error::fs("read archive", source))?;
        let raw_key = entry
            .path()
            .map_err(Error::fs("read archive", source))?
            .to_string_lossy()
            .replace('\\', "/");
        let entry_type = entry.header().entry_type();
        let described = ArchiveEntry {
            key: raw_key,
            is_directory: entry_type.is_dir(),
            size: entry.header().size().unwrap_or(0),
        };
        let Some(key) = destination_key(&described, options) else {
            continue;
        };
        let target = destination.join(&key);

        if entry_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(Error::fs("create directory", &target))?;
        } else if entry_type.is_symlink() || entry_type.is_hard_link() {
            if let Some(link_target) = entry
                .link_name()
                .map_err(Error::fs("read archive", source))?
            {
                links.push((key, link_target.into_owned()));
            }
        } else if entry_type.is_file() {
            write_tar_file(&mut entry, &target, described.size)?;
        }
    }

    for (key, link_target) in links {
        bail_if_cancelled(cancel)?;
        materialize_link(destination, &key, &link_target)?;
    }
    Ok(())
}

fn write_tar_file(entry: &mut tar::Entry<'_, Box<dyn Read>>, target: &Path, size: u64) -> Result<()> {
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
    if let Ok(mode) = entry.header().mode() {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode));
    }
    Ok(())
}

/// Copy the file or directory a link entry referenced. Targets that do
/// not resolve inside the destination are skipped.
fn materialize_link(destination: &Path, key: &str, link_target: &Path) -> Result<()> {
    let link_path = destination.join(key);
    let base = link_path.parent().unwrap_or(destination);
    let resolved = normalize(&base.join(link_target));
    if !resolved.starts_with(destination) {
        debug!(key, target = %link_target.display(), "Link target escapes destination, skipped");
        return Ok(());
    }
    match std::fs::metadata(&resolved) {
        Ok(meta) if meta.is_dir() => copy_tree(&resolved, &link_path),
        Ok(_) => {
            if let Some(parent) = link_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(Error::fs("create directory", parent.to_path_buf()))?;
            }
            std::fs::copy(&resolved, &link_path)
                .map(|_| ())
                .map_err(Error::fs("copy file", &resolved))
        }
        Err(_) => {
            debug!(key, target = %resolved.display(), "Link target missing, skipped");
            Ok(())
        }
    }
}

fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    let mut pending = vec![(source.to_path_buf(), destination.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        std::fs::create_dir_all(&to).map_err(Error::fs("create directory", &to))?;
        for entry in std::fs::read_dir(&from).map_err(Error::fs("read directory", &from))? {
            let entry = entry.map_err(Error::fs("read directory", &from))?;
            let target = to.join(entry.file_name());
            if entry
                .file_type()
                .map_err(Error::fs("probe", entry.path()))?
                .is_dir()
            {
                pending.push((entry.path(), target));
            } else {
                std::fs::copy(entry.path(), &target)
                    .map_err(Error::fs("copy file", entry.path()))?;
            }
        }
    }
    Ok(())
}

/// Resolve `.` and `..` components lexically.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}
