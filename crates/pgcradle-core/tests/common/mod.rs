// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for pgcradle-core integration tests.
//!
//! Builds fake engine bundles whose "binaries" are shell scripts, so
//! the full pipeline (extraction, attribute fix-ups, version probes)
//! runs against the real process executor without PostgreSQL.

#![allow(dead_code)]

use std::io::Write;
use std::path::Path;

/// A scripted stand-in for one engine binary.
pub struct FakeBinary {
    pub name: &'static str,
    pub version_line: String,
}

impl FakeBinary {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            version_line: format!("{name} (PostgreSQL) 16.4"),
        }
    }

    /// Shell script body: answers `--version`, reports stopped on
    /// `status`, succeeds on anything else.
    pub fn script(&self) -> String {
        format!(
            "#!/bin/sh\ncase \"$1\" in\n  --version) echo \"{}\";;\n  status) exit 3;;\n  *) exit 0;;\nesac\n",
            self.version_line
        )
    }
}

/// The three binaries every instance needs.
pub fn required_binaries() -> Vec<FakeBinary> {
    ["initdb", "pg_ctl", "postgres"]
        .into_iter()
        .map(FakeBinary::new)
        .collect()
}

/// The optional binaries that switch on standard mode.
pub fn optional_binaries() -> Vec<FakeBinary> {
    ["psql", "pg_dump", "pg_restore"]
        .into_iter()
        .map(FakeBinary::new)
        .collect()
}

/// Write a zip bundle with the given binaries under `pgsql/bin/`.
pub fn build_engine_zip(path: &Path, binaries: &[FakeBinary]) {
    let file = std::fs::File::create(path).expect("create bundle");
    let mut writer = zip::ZipWriter::new(file);
    let executable = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
    for binary in binaries {
        writer
            .start_file(format!("pgsql/bin/{}", binary.name), executable)
            .expect("start entry");
        writer.write_all(binary.script().as_bytes()).expect("write script");
    }
    writer
        .start_file(
            "pgsql/share/postgresql.conf.sample",
            zip::write::SimpleFileOptions::default(),
        )
        .expect("start entry");
    writer.write_all(b"# defaults\n").expect("write sample");
    writer.finish().expect("finish bundle");
}

/// Write a txz bundle with the given binaries under `pgsql/bin/`.
pub fn build_engine_txz(path: &Path, binaries: &[FakeBinary]) {
    let file = std::fs::File::create(path).expect("create bundle");
    let encoder = xz2::write::XzEncoder::new(file, 6);
    let mut builder = tar::Builder::new(encoder);
    for binary in binaries {
        let script = binary.script();
        let mut header = tar::Header::new_gnu();
        header.set_size(script.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                format!("pgsql/bin/{}", binary.name),
                script.as_bytes(),
            )
            .expect("append script");
    }
    let sample = b"# defaults\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(sample.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "pgsql/share/postgresql.conf.sample", &sample[..])
        .expect("append sample");
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish xz");
}

/// Wrap a txz in a jar the way upstream Maven bundles ship.
pub fn build_engine_jar(path: &Path, binaries: &[FakeBinary]) {
    let txz = tempfile::NamedTempFile::new().expect("temp txz");
    build_engine_txz(txz.path(), binaries);
    let txz_bytes = std::fs::read(txz.path()).expect("read txz");

    let file = std::fs::File::create(path).expect("create jar");
    let mut writer = zip::ZipWriter::new(file);
    writer
        .start_file(
            "META-INF/MANIFEST.MF",
            zip::write::SimpleFileOptions::default(),
        )
        .expect("start manifest");
    writer
        .write_all(b"Manifest-Version: 1.0\n")
        .expect("write manifest");
    writer
        .start_file(
            "postgres-linux-x86_64.txz",
            zip::write::SimpleFileOptions::default(),
        )
        .expect("start txz entry");
    writer.write_all(&txz_bytes).expect("write txz");
    writer.finish().expect("finish jar");
}

/// Pick a free TCP port by binding and releasing an ephemeral one.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}
