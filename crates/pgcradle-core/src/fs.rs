// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem service.
//!
//! Semantic operations over `tokio::fs` with operation/path context on
//! every failure, plus the sentinel-touch primitive used for on-disk
//! once-semantics and the cache-stable filename sanitizer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// What a path resolves to on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Nothing exists at the path.
    Missing,
    /// The path is a regular file.
    File,
    /// The path is a directory.
    Directory,
}

/// Characters that are invalid in filenames on at least one supported
/// platform. The union is applied everywhere so cache names stay portable.
const INVALID_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Cloneable filesystem handle.
///
/// Sentinel touches serialize on a shared lock; everything else is
/// plain async I/O.
#[derive(Debug, Clone, Default)]
pub struct FileSystem {
    sentinel_lock: Arc<Mutex<()>>,
}

impl FileSystem {
    /// Create a new handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe what exists at `path`.
    pub async fn path_kind(&self, path: &Path) -> Result<PathKind> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(PathKind::Directory),
            Ok(_) => Ok(PathKind::File),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PathKind::Missing),
            Err(e) => Err(Error::fs("probe", path)(e)),
        }
    }

    /// Create `path` and its parents. Idempotent; rejects a path that is
    /// an existing file.
    pub async fn ensure_directory(&self, path: &Path) -> Result<()> {
        match self.path_kind(path).await? {
            PathKind::Directory => Ok(()),
            PathKind::File => Err(Error::Validation(format!(
                "{} exists and is a file, expected a directory",
                path.display()
            ))),
            PathKind::Missing => tokio::fs::create_dir_all(path)
                .await
                .map_err(Error::fs("create directory", path)),
        }
    }

    /// Copy one file, creating the destination's parent if needed.
    pub async fn copy_file(&self, source: &Path, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            self.ensure_directory(parent).await?;
        }
        tokio::fs::copy(source, destination)
            .await
            .map(|_| ())
            .map_err(Error::fs("copy file", source))
    }

    /// Recursively copy a directory tree.
    pub async fn copy_directory(&self, source: &Path, destination: &Path) -> Result<()> {
        let mut pending = vec![(source.to_path_buf(), destination.to_path_buf())];
        while let Some((from, to)) = pending.pop() {
            self.ensure_directory(&to).await?;
            let mut entries = tokio::fs::read_dir(&from)
                .await
                .map_err(Error::fs("read directory", &from))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(Error::fs("read directory", &from))?
            {
                let target = to.join(entry.file_name());
                let kind = entry
                    .file_type()
                    .await
                    .map_err(Error::fs("probe", entry.path()))?;
                if kind.is_dir() {
                    pending.push((entry.path(), target));
                } else {
                    tokio::fs::copy(entry.path(), &target)
                        .await
                        .map_err(Error::fs("copy file", entry.path()))?;
                }
            }
        }
        Ok(())
    }

    /// Write an async reader out to a new file.
    pub async fn copy_reader_to_file<R>(&self, mut reader: R, destination: &Path) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(parent) = destination.parent() {
            self.ensure_directory(parent).await?;
        }
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(Error::fs("create file", destination))?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(Error::fs("write file", destination))?;
        file.flush()
            .await
            .map_err(Error::fs("write file", destination))?;
        Ok(())
    }

    /// Delete a file; missing files are not an error.
    pub async fn delete_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::fs("delete file", path)(e)),
        }
    }

    /// Recursively delete a directory tree; a missing tree is not an error.
    pub async fn delete_directory(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted directory tree");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::fs("delete directory", path)(e)),
        }
    }

    /// Enumerate entries under `directory`, optionally recursing and
    /// filtering file names by a glob pattern.
    pub async fn enumerate(
        &self,
        directory: &Path,
        pattern: Option<&str>,
        recurse: bool,
    ) -> Result<Vec<PathBuf>> {
        let pattern = match pattern {
            Some(p) => Some(
                glob::Pattern::new(p)
                    .map_err(|e| Error::Validation(format!("invalid glob pattern {p:?}: {e}")))?,
            ),
            None => None,
        };
        let root = directory.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || {
            let mut walker = walkdir::WalkDir::new(&root).min_depth(1);
            if !recurse {
                walker = walker.max_depth(1);
            }
            let mut found = Vec::new();
            for entry in walker.sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                    Error::Fs {
                        operation: "enumerate",
                        path,
                        source,
                    }
                })?;
                let name = entry.file_name().to_string_lossy();
                if pattern
                    .as_ref()
                    .is_none_or(|p| p.matches(&name))
                {
                    found.push(entry.into_path());
                }
            }
            Ok::<_, Error>(found)
        })
        .await
        .expect("enumerate task panicked")?;
        Ok(entries)
    }

    /// Read file attributes.
    pub async fn attributes(&self, path: &Path) -> Result<std::fs::Metadata> {
        tokio::fs::metadata(path)
            .await
            .map_err(Error::fs("probe", path))
    }

    /// Atomically create a zero-byte sentinel. Returns `true` iff this
    /// caller created it. Serialized across concurrent callers on this
    /// handle's clones; the create itself is `O_CREAT|O_EXCL`, so the
    /// discipline is create-or-skip, never create-and-retry.
    pub async fn touch_sentinel(&self, path: &Path) -> Result<bool> {
        let _guard = self.sentinel_lock.lock().await;
        if let Some(parent) = path.parent() {
            self.ensure_directory(parent).await?;
        }
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::fs("create sentinel", path)(e)),
        }
    }

    /// Fail unless `path` is an existing file.
    pub async fn require_file(&self, path: &Path) -> Result<()> {
        match self.path_kind(path).await? {
            PathKind::File => Ok(()),
            _ => Err(Error::Validation(format!(
                "{} does not exist or is not a file",
                path.display()
            ))),
        }
    }

    /// Fail unless `path` is an existing directory.
    pub async fn require_directory(&self, path: &Path) -> Result<()> {
        match self.path_kind(path).await? {
            PathKind::Directory => Ok(()),
            _ => Err(Error::Validation(format!(
                "{} does not exist or is not a directory",
                path.display()
            ))),
        }
    }

    /// Fail if `path` is an existing file.
    pub async fn require_not_file(&self, path: &Path) -> Result<()> {
        match self.path_kind(path).await? {
            PathKind::File => Err(Error::Validation(format!(
                "{} already exists as a file",
                path.display()
            ))),
            _ => Ok(()),
        }
    }

    /// Fail if `path` is an existing directory.
    pub async fn require_not_directory(&self, path: &Path) -> Result<()> {
        match self.path_kind(path).await? {
            PathKind::Directory => Err(Error::Validation(format!(
                "{} already exists as a directory",
                path.display()
            ))),
            _ => Ok(()),
        }
    }
}

/// Strip OS-invalid characters from `name`. Iff anything was stripped,
/// a SHA-256 hex digest of the original is appended so distinct invalid
/// inputs map to distinct valid names and identical inputs map
/// identically.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !INVALID_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();
    if cleaned == name {
        return cleaned;
    }
    let digest = Sha256::digest(name.as_bytes());
    format!("{cleaned}-{digest:x}")
}
