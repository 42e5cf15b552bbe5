// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pg_restore front-end.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Binding;
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, ExecSpec};
use crate::fs::{FileSystem, PathKind};
use crate::options::DataClusterConfiguration;

/// Typed options for one restore run.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Archive file or directory produced by pg_dump.
    pub file: PathBuf,
    /// Database to restore into.
    pub database: Option<String>,
    /// Role to connect as; the cluster superuser when unset.
    pub user: Option<String>,
    /// Password handed to the child via `PGPASSWORD` only.
    pub password: Option<String>,
    /// Drop objects before recreating them.
    pub clean: bool,
    /// Create the database before restoring into it.
    pub create: bool,
    /// Restore data, not schema.
    pub data_only: bool,
    /// Restore schema, not data.
    pub schema_only: bool,
    /// Stop on the first error.
    pub exit_on_error: bool,
    /// Run the whole restore in one transaction.
    pub single_transaction: bool,
    /// Skip ownership assignments.
    pub no_owner: bool,
    /// Skip privilege assignments.
    pub no_privileges: bool,
    /// Parallel restore jobs.
    pub jobs: Option<u32>,
    /// Tables to restore (`-t`, repeated).
    pub tables_to_restore: Vec<String>,
}

impl RestoreOptions {
    /// Restore from `file` with every other option defaulted.
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
        if self.single_transaction && self.jobs.is_some() {
            return Err(Error::Validation(
                "--single-transaction cannot be combined with --jobs".to_string(),
            ));
        }
        Ok(())
    }
}

/// Imports pg_dump archives via `pg_restore`.
#[derive(Debug, Clone)]
pub struct RestoreController {
    binding: Binding,
}

impl RestoreController {
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

    /// Import an archive per the typed options.
    pub async fn restore(
        &self,
        cluster: &DataClusterConfiguration,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        options.validate()?;
        // Directory-format archives are directories, not files.
        if self.binding.fs.path_kind(&options.file).await? == PathKind::Missing {
            return Err(Error::Validation(format!(
                "restore archive {} does not exist",
                options.file.display()
            )));
        }

        let mut spec = ExecSpec::new(&self.binding.binary)
            .arg("-U")
            .arg(options.user.as_deref().unwrap_or(&cluster.superuser))
            .arg("-h")
            .arg(&cluster.host)
            .arg("-p")
            .arg(cluster.port.to_string());

        if let Some(database) = &options.database {
            spec = spec.arg("-d").arg(database);
        }
        if options.clean {
            spec = spec.arg("--clean");
        }
        if options.create {
            spec = spec.arg("--create");
        }
        if options.data_only {
            spec = spec.arg("--data-only");
        }
        if options.schema_only {
            spec = spec.arg("--schema-only");
        }
        if options.exit_on_error {
            spec = spec.arg("--exit-on-error");
        }
        if options.single_transaction {
            spec = spec.arg("--single-transaction");
        }
        if options.no_owner {
            spec = spec.arg("--no-owner");
        }
        if options.no_privileges {
            spec = spec.arg("--no-privileges");
        }
        if let Some(jobs) = options.jobs {
            spec = spec.arg("--jobs").arg(jobs.to_string());
        }
        for table in &options.tables_to_restore {
            spec = spec.arg("-t").arg(table);
        }
        spec = spec.arg(options.file.to_string_lossy());
        if let Some(password) = &options.password {
            spec = spec.env("PGPASSWORD", password);
        }
        let spec = spec.on_stderr(Arc::new(|line| warn!(source = "pg_restore", "{line}")));

        self.binding.executor.execute(spec, cancel).await?;
        info!(cluster_id = %cluster.unique_id, file = %options.file.display(), "Restore finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockCommandExecutor;
    use tempfile::TempDir;

    fn controller(temp: &TempDir, mock: Arc<MockCommandExecutor>) -> RestoreController {
        RestoreController::new(
            temp.path().join("bin/pg_restore"),
            temp.path().to_path_buf(),
            FileSystem::new(),
            mock,
        )
    }

    #[tokio::test]
    async fn archive_path_lands_last() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockCommandExecutor::new());
        let cluster = DataClusterConfiguration::new("primary", 5561);

        let archive = temp.path().join("app.dump");
        std::fs::write(&archive, b"PGDMP").unwrap();
        let options = RestoreOptions {
            database: Some("appdb".into()),
            clean: true,
            exit_on_error: true,
            ..RestoreOptions::new(&archive)
        };

        controller(&temp, mock.clone())
            .restore(&cluster, &options, &CancellationToken::new())
            .await
            .unwrap();

        let args = &mock.recorded_for("pg_restore")[0].args;
        let expected: Vec<String> = [
            "-U",
            "postgres",
            "-h",
            "localhost",
            "-p",
            "5561",
            "-d",
            "appdb",
            "--clean",
            "--exit-on-error",
            &archive.to_string_lossy(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, &expected);
    }

    #[tokio::test]
    async fn missing_archive_fails_validation() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockCommandExecutor::new());
        let cluster = DataClusterConfiguration::new("primary", 5561);

        let err = controller(&temp, mock.clone())
            .restore(
                &cluster,
                &RestoreOptions::new(temp.path().join("missing.dump")),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(mock.recorded().is_empty());
    }

    #[tokio::test]
    async fn directory_format_archives_are_accepted() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockCommandExecutor::new());
        let cluster = DataClusterConfiguration::new("primary", 5561);

        let archive = temp.path().join("dumpdir");
        std::fs::create_dir(&archive).unwrap();

        controller(&temp, mock.clone())
            .restore(
                &cluster,
                &RestoreOptions::new(&archive),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(mock.recorded().len(), 1);
    }

    #[tokio::test]
    async fn single_transaction_with_jobs_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockCommandExecutor::new());
        let cluster = DataClusterConfiguration::new("primary", 5561);
        let options = RestoreOptions {
            single_transaction: true,
            jobs: Some(4),
            ..RestoreOptions::new("/tmp/a.dump")
        };

        let err = controller(&temp, mock)
            .restore(&cluster, &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
