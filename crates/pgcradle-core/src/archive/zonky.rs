// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Two-level extraction strategy for jar-wrapped txz bundles.
//!
//! The outer `.jar` is unpacked with the zip reader into the archive's
//! own directory, then the enclosed `.txz` is extracted with the
//! multi-format reader into the final destination.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ArchiveEntry, ExtractOptions, Extractor, SharpExtractor, SystemExtractor};
use crate::error::{Error, Result};

/// Jar-wrapping-txz strategy.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZonkyExtractor {
    system: SystemExtractor,
    sharp: SharpExtractor,
}

impl ZonkyExtractor {
    /// Create the strategy.
    pub fn new() -> Self {
        Self::default()
    }

    async fn inner_archive_key(&self, source: &Path) -> Result<String> {
        let entries = self.system.enumerate(source).await?;
        entries
            .into_iter()
            .find(|e| !e.is_directory && e.key.to_ascii_lowercase().ends_with(".txz"))
            .map(|e| e.key)
            .ok_or_else(|| {
                Error::Archive(format!("no .txz entry inside {}", source.display()))
            })
    }
}

#[async_trait]
impl Extractor for ZonkyExtractor {
    async fn enumerate(&self, source: &Path) -> Result<Vec<ArchiveEntry>> {
        self.system.enumerate(source).await
    }

    async fn extract(
        &self,
        source: &Path,
        destination: &Path,
        options: ExtractOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let staging = source.parent().ok_or_else(|| {
            Error::Archive(format!("{} has no parent directory", source.display()))
        })?;

        let inner_key = self.inner_archive_key(source).await?;
        debug!(jar = %source.display(), inner = %inner_key, "Unpacking wrapped bundle");

        self.system
            .extract(source, staging, ExtractOptions::new(), cancel)
            .await?;

        let inner = staging.join(&inner_key);
        self.sharp.extract(&inner, destination, options, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn build_txz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        let mut builder = tar::Builder::new(encoder);
        for (key, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, *key, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn build_jar(path: &Path, txz_name: &str, txz_bytes: &[u8]) {
        let file = File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        writer
            .start_file("META-INF/MANIFEST.MF", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"Manifest-Version: 1.0\n").unwrap();
        writer.start_file(txz_name, SimpleFileOptions::default()).unwrap();
        writer.write_all(txz_bytes).unwrap();
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn extracts_txz_wrapped_in_jar() {
        let temp = TempDir::new().unwrap();
        let jar = temp.path().join("embedded-postgres.jar");
        let txz = build_txz_bytes(&[("pg/bin/postgres", b"pg"), ("pg/share/conf", b"c")]);
        build_jar(&jar, "postgres-linux-x86_64.txz", &txz);

        let dest = temp.path().join("instance");
        ZonkyExtractor::new()
            .extract(&jar, &dest, ExtractOptions::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(dest.join("pg/bin/postgres")).unwrap(), b"pg");
        assert!(temp.path().join("postgres-linux-x86_64.txz").is_file());
    }

    #[tokio::test]
    async fn inner_options_apply_to_the_txz_not_the_jar() {
        let temp = TempDir::new().unwrap();
        let jar = temp.path().join("bundle.jar");
        let txz = build_txz_bytes(&[("pg/bin/initdb", b"i")]);
        build_jar(&jar, "inner.txz", &txz);

        let dest = temp.path().join("instance");
        ZonkyExtractor::new()
            .extract(
                &jar,
                &dest,
                ExtractOptions::new().ignore_root_dir(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(dest.join("bin/initdb").is_file());
        assert!(!dest.join("pg").exists());
    }

    #[tokio::test]
    async fn jar_without_txz_is_rejected() {
        let temp = TempDir::new().unwrap();
        let jar = temp.path().join("plain.jar");
        build_jar(&jar, "not-an-archive.txt", b"text");

        let err = ZonkyExtractor::new()
            .extract(
                &jar,
                &temp.path().join("out"),
                ExtractOptions::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[tokio::test]
    async fn enumerate_lists_the_jar_surface() {
        let temp = TempDir::new().unwrap();
        let jar = temp.path().join("bundle.jar");
        build_jar(&jar, "inner.txz", &build_txz_bytes(&[("pg/x", b"x")]));

        let entries = ZonkyExtractor::new().enumerate(&jar).await.unwrap();
        assert!(entries.iter().any(|e| e.key == "inner.txz"));
    }
}
