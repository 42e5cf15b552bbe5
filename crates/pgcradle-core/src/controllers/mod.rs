// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed front-ends for the engine binaries.
//!
//! Each controller binds an absolute binary path, the instance layout,
//! and the process executor, and builds a fixed, reproducible argument
//! vector per operation.

mod cluster;
mod dump;
mod initdb;
mod restore;
mod sql;

pub use cluster::{ClusterController, RuntimeStatus};
pub use dump::{DumpController, DumpFormat, DumpOptions};
pub use initdb::InitDbController;
pub use restore::{RestoreController, RestoreOptions};
pub use sql::{DatabaseRow, DatabaseRowHandler, OutputFormat, OutputMode, SqlController};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::exec::{CommandExecutor, ExecSpec};
use crate::fs::FileSystem;

/// Shared binding of one binary to the instance it lives in.
#[derive(Clone)]
pub(crate) struct Binding {
    pub binary: PathBuf,
    pub instance_directory: PathBuf,
    pub fs: FileSystem,
    pub executor: Arc<dyn CommandExecutor>,
}

impl Binding {
    pub fn new(
        binary: PathBuf,
        instance_directory: PathBuf,
        fs: FileSystem,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            binary,
            instance_directory,
            fs,
            executor,
        }
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("binary", &self.binary)
            .field("instance_directory", &self.instance_directory)
            .finish()
    }
}

/// Invoke `binary --version` and return the first output line.
pub(crate) async fn probe_version(
    executor: &Arc<dyn CommandExecutor>,
    binary: &Path,
    cancel: &CancellationToken,
) -> Result<String> {
    let line = Arc::new(std::sync::Mutex::new(String::new()));
    let sink = line.clone();
    let spec = ExecSpec::new(binary)
        .arg("--version")
        .on_stdout(Arc::new(move |output| {
            let mut line = sink.lock().expect("version line lock");
            if line.is_empty() {
                *line = output.trim().to_string();
            }
        }));
    executor.execute(spec, cancel).await?;
    let line = line.lock().expect("version line lock").clone();
    Ok(line)
}
