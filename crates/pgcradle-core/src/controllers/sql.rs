// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! psql front-end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::Binding;
use crate::error::Result;
use crate::exec::{CommandExecutor, ExecSpec, LineHandler};
use crate::fs::FileSystem;
use crate::options::DataClusterConfiguration;

/// One row of `psql --list --csv --tuples-only` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRow {
    /// Database name.
    pub name: String,
    /// Owning role.
    pub owner: String,
    /// Encoding.
    pub encoding: String,
    /// Locale provider.
    pub locale_provider: String,
    /// LC_COLLATE.
    pub collate: String,
    /// LC_CTYPE.
    pub ctype: String,
    /// Locale.
    pub locale: String,
    /// ICU rules.
    pub icu_rules: String,
    /// Access privileges.
    pub access_privileges: String,
}

impl DatabaseRow {
    /// Parse a 9-column CSV line; returns `None` for anything else.
    pub fn parse_csv(line: &str) -> Option<Self> {
        let fields = split_csv(line);
        if fields.len() != 9 {
            return None;
        }
        let mut fields = fields.into_iter();
        Some(Self {
            name: fields.next()?,
            owner: fields.next()?,
            encoding: fields.next()?,
            locale_provider: fields.next()?,
            collate: fields.next()?,
            ctype: fields.next()?,
            locale: fields.next()?,
            icu_rules: fields.next()?,
            access_privileges: fields.next()?,
        })
    }
}

/// Minimal CSV field splitter handling quoted fields and doubled
/// quotes, which is all psql emits.
fn split_csv(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' => quoted = true,
            ',' if !quoted => {
                fields.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

/// Callback invoked once per parsed database row.
pub type DatabaseRowHandler = Arc<dyn Fn(DatabaseRow) + Send + Sync>;

/// Result shaping for psql runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// psql's default aligned table.
    #[default]
    Aligned,
    /// Unaligned output (`--no-align`).
    Unaligned,
    /// CSV output (`--csv`).
    Csv,
}

/// Output shaping for SQL execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputFormat {
    /// Table shaping.
    pub mode: OutputMode,
    /// Field separator (`-F`).
    pub field_separator: Option<String>,
    /// Record separator (`-R`).
    pub record_separator: Option<String>,
    /// Rows only, no headers or footers (`--tuples-only`).
    pub tuples_only: bool,
    /// Send results to a file instead of stdout (`-o`). When set, no
    /// stdout listener is registered.
    pub output_file: Option<PathBuf>,
}

impl OutputFormat {
    /// psql's default shaping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unaligned output.
    pub fn unaligned() -> Self {
        Self {
            mode: OutputMode::Unaligned,
            ..Self::default()
        }
    }

    /// CSV output.
    pub fn csv() -> Self {
        Self {
            mode: OutputMode::Csv,
            ..Self::default()
        }
    }

    /// Set the field separator.
    pub fn field_separator(mut self, separator: impl Into<String>) -> Self {
        self.field_separator = Some(separator.into());
        self
    }

    /// Set the record separator.
    pub fn record_separator(mut self, separator: impl Into<String>) -> Self {
        self.record_separator = Some(separator.into());
        self
    }

    /// Rows only.
    pub fn tuples_only(mut self) -> Self {
        self.tuples_only = true;
        self
    }

    /// Send results to a file.
    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    fn append_to(&self, mut spec: ExecSpec) -> ExecSpec {
        match self.mode {
            OutputMode::Aligned => {}
            OutputMode::Unaligned => spec = spec.arg("--no-align"),
            OutputMode::Csv => spec = spec.arg("--csv"),
        }
        if let Some(separator) = &self.field_separator {
            spec = spec.arg("-F").arg(separator);
        }
        if let Some(separator) = &self.record_separator {
            spec = spec.arg("-R").arg(separator);
        }
        if self.tuples_only {
            spec = spec.arg("--tuples-only");
        }
        if let Some(path) = &self.output_file {
            spec = spec.arg("-o").arg(path.to_string_lossy());
        }
        spec
    }
}

/// Executes SQL against a running cluster via `psql`.
#[derive(Debug, Clone)]
pub struct SqlController {
    binding: Binding,
}

impl SqlController {
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

    fn connection_spec(
        &self,
        cluster: &DataClusterConfiguration,
        user: Option<&str>,
    ) -> ExecSpec {
        ExecSpec::new(&self.binding.binary)
            .arg("-U")
            .arg(user.unwrap_or(&cluster.superuser))
            .arg("-h")
            .arg(&cluster.host)
            .arg("-p")
            .arg(cluster.port.to_string())
    }

    /// List the cluster's databases, invoking `on_row` per record.
    pub async fn list_databases(
        &self,
        cluster: &DataClusterConfiguration,
        on_row: DatabaseRowHandler,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = self
            .connection_spec(cluster, None)
            .args(["--list", "--csv", "--tuples-only"])
            .on_stdout(Arc::new(move |line| {
                if let Some(row) = DatabaseRow::parse_csv(line) {
                    on_row(row);
                }
            }))
            .on_stderr(stderr_logger());
        self.binding.executor.execute(spec, cancel).await?;
        Ok(())
    }

    /// List the cluster's databases into a vector.
    pub async fn databases(
        &self,
        cluster: &DataClusterConfiguration,
        cancel: &CancellationToken,
    ) -> Result<Vec<DatabaseRow>> {
        let rows = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = rows.clone();
        self.list_databases(
            cluster,
            Arc::new(move |row| sink.lock().expect("row sink lock").push(row)),
            cancel,
        )
        .await?;
        let rows = rows.lock().expect("row sink lock").clone();
        Ok(rows)
    }

    /// Execute a SQL string.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_sql(
        &self,
        cluster: &DataClusterConfiguration,
        sql: &str,
        database: Option<&str>,
        user: Option<&str>,
        on_output: Option<LineHandler>,
        format: &OutputFormat,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = self.statement_spec(cluster, database, user, on_output, format);
        let spec = spec.arg("-c").arg(sql);
        self.binding.executor.execute(spec, cancel).await?;
        Ok(())
    }

    /// Execute a SQL script file.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_file(
        &self,
        cluster: &DataClusterConfiguration,
        script: &Path,
        database: Option<&str>,
        user: Option<&str>,
        on_output: Option<LineHandler>,
        format: &OutputFormat,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.binding.fs.require_file(script).await?;
        let spec = self.statement_spec(cluster, database, user, on_output, format);
        let spec = spec.arg("-f").arg(script.to_string_lossy());
        self.binding.executor.execute(spec, cancel).await?;
        Ok(())
    }

    /// The shared argument scaffold of `execute_sql` and
    /// `execute_file`; only the trailing `-c`/`-f` differs.
    fn statement_spec(
        &self,
        cluster: &DataClusterConfiguration,
        database: Option<&str>,
        user: Option<&str>,
        on_output: Option<LineHandler>,
        format: &OutputFormat,
    ) -> ExecSpec {
        let mut spec = self.connection_spec(cluster, user);
        if let Some(database) = database {
            spec = spec.arg("-d").arg(database);
        }
        spec = format.append_to(spec);
        // With an output file the child owns its stdout; registering a
        // listener would capture nothing and change the exec path.
        if format.output_file.is_none()
            && let Some(handler) = on_output
        {
            spec = spec.on_stdout(handler);
        }
        spec.on_stderr(stderr_logger())
    }
}

fn stderr_logger() -> LineHandler {
    Arc::new(|line| warn!(source = "psql", "{line}"))
}
