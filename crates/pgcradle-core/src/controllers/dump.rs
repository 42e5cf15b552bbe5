// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pg_dump front-end.

use std::path::PathBuf;
use std::sync::Arc;

use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Binding;
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, ExecSpec};
use crate::fs::FileSystem;
use crate::options::DataClusterConfiguration;

/// pg_dump archive formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum DumpFormat {
    /// Custom format (`c`), the pg_restore default input.
    #[default]
    #[strum(serialize = "c")]
    Custom,
    /// Directory format (`d`).
    #[strum(serialize = "d")]
    Directory,
    /// Tar format (`t`).
    #[strum(serialize = "t")]
    Tar,
    /// Plain SQL (`p`).
    #[strum(serialize = "p")]
    Plain,
}

/// Typed options for one dump run.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    /// Output file or directory.
    pub file: PathBuf,
    /// Database to dump; the maintenance database when unset.
    pub database: Option<String>,
    /// Role to connect as; the cluster superuser when unset.
    pub user: Option<String>,
    /// Password handed to the child via `PGPASSWORD` only.
    pub password: Option<String>,
    /// Archive format.
    pub format: DumpFormat,
    /// Dump data, not schema.
    pub data_only: bool,
    /// Dump schema, not data.
    pub schema_only: bool,
    /// Emit clean (drop) statements.
    pub clean: bool,
    /// Emit a create-database statement.
    pub create: bool,
    /// Skip ownership assignments.
    pub no_owner: bool,
    /// Skip privilege assignments.
    pub no_privileges: bool,
    /// Include large objects.
    pub blobs: bool,
    /// Parallel dump jobs (directory format only).
    pub jobs: Option<u32>,
    /// Schemas to dump (`-n`, repeated).
    pub schemas_to_dump: Vec<String>,
    /// Schemas to exclude (`-N`, repeated).
    pub schemas_to_exclude: Vec<String>,
    /// Tables to dump (`-t`, repeated).
    pub tables_to_dump: Vec<String>,
    /// Tables to exclude (`-T`, repeated).
    pub tables_to_exclude: Vec<String>,
}

impl DumpOptions {
    /// Dump into `file` with every other option defaulted.
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.data_only && self.schema_only {
            return Err(Error::Validation(
                "--data-only and --schema-only are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Exports databases via `pg_dump`.
#[derive(Debug, Clone)]
pub struct DumpController {
    binding: Binding,
}

impl DumpController {
    /// Bind the controller to an instance.
    pub fn new(
        binary: PathBuf,
        instance_directory: PathBuf,
        fs: FileSystem,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            binding: Binding::new(binary, instance_directory, fs, executor),
        }
    }

    /// Export a database per the typed options.
    pub async fn dump(
        &self,
        cluster: &DataClusterConfiguration,
        options: &DumpOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        options.validate()?;

        let mut spec = ExecSpec::new(&self.binding.binary)
            .arg("-U")
            .arg(options.user.as_deref().unwrap_or(&cluster.superuser))
            .arg("-h")
            .arg(&cluster.host)
            .arg("-p")
            .arg(cluster.port.to_string())
            .arg("--format")
            .arg(options.format.to_string())
            .arg("--file")
            .arg(options.file.to_string_lossy());

        if options.data_only {
            spec = spec.arg("--data-only");
        }
        if options.schema_only {
            spec = spec.arg("--schema-only");
        }
        if options.clean {
            spec = spec.arg("--clean");
        }
        if options.create {
            spec = spec.arg("--create");
        }
        if options.no_owner {
            spec = spec.arg("--no-owner");
        }
        if options.no_privileges {
            spec = spec.arg("--no-privileges");
        }
        if options.blobs {
            spec = spec.arg("--blobs");
        }
        if let Some(jobs) = options.jobs {
            spec = spec.arg("--jobs").arg(jobs.to_string());
        }
        for schema in &options.schemas_to_dump {
            spec = spec.arg("-n").arg(schema);
        }
        for schema in &options.schemas_to_exclude {
            spec = spec.arg("-N").arg(schema);
        }
        for table in &options.tables_to_dump {
            spec = spec.arg("-t").arg(table);
        }
        for table in &options.tables_to_exclude {
            spec = spec.arg("-T").arg(table);
        }
        if let Some(database) = &options.database {
            spec = spec.arg(database);
        }
        if let Some(password) = &options.password {
            spec = spec.env("PGPASSWORD", password);
        }
        let spec = spec.on_stderr(Arc::new(|line| warn!(source = "pg_dump", "{line}")));

        self.binding.executor.execute(spec, cancel).await?;
        info!(cluster_id = %cluster.unique_id, file = %options.file.display(), "Dump written");
        Ok(())
    }
}
