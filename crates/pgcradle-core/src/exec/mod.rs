// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process invocation and output streaming.
//!
//! Wraps the external PostgreSQL binaries. Two execution paths exist:
//! a streaming path that pipes stdout/stderr line-by-line to listeners,
//! and a capture-free path used when holding the child's output handles
//! would deadlock (the postmaster keeps stdout open across its children,
//! so `pg_ctl start` must never be captured).

mod mock;
mod native;

pub use mock::{MockCommandExecutor, MockResponse, RecordedCommand};
pub use native::NativeCommandExecutor;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Callback invoked once per line of child output.
pub type LineHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// A fully described child-process invocation.
#[derive(Clone)]
pub struct ExecSpec {
    /// Absolute path of the binary to run.
    pub program: PathBuf,
    /// Arguments, passed as a vector with no shell interpolation.
    pub args: Vec<String>,
    /// Extra environment variables for the child only.
    pub envs: HashMap<String, String>,
    /// Working directory for the child, if different from the parent's.
    pub working_dir: Option<PathBuf>,
    /// Fail with [`crate::Error::CommandFailed`] on non-zero exit.
    pub check_exit: bool,
    /// Listener for stdout lines. Registering any listener selects the
    /// streaming path.
    pub stdout_line: Option<LineHandler>,
    /// Listener for stderr lines.
    pub stderr_line: Option<LineHandler>,
}

impl ExecSpec {
    /// Describe an invocation of `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: HashMap::new(),
            working_dir: None,
            check_exit: true,
            stdout_line: None,
            stderr_line: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    /// Set the child's working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Return the exit code for caller inspection instead of failing on
    /// non-zero exit.
    pub fn no_throw(mut self) -> Self {
        self.check_exit = false;
        self
    }

    /// Register a stdout line listener.
    pub fn on_stdout(mut self, handler: LineHandler) -> Self {
        self.stdout_line = Some(handler);
        self
    }

    /// Register a stderr line listener.
    pub fn on_stderr(mut self, handler: LineHandler) -> Self {
        self.stderr_line = Some(handler);
        self
    }

    /// True when any output listener is registered.
    pub fn captures_output(&self) -> bool {
        self.stdout_line.is_some() || self.stderr_line.is_some()
    }

    /// Program and arguments rendered for logs and error messages.
    pub fn command_line(&self) -> String {
        let program = self
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string());
        if self.args.is_empty() {
            program
        } else {
            format!("{} {}", program, self.args.join(" "))
        }
    }

    /// File name of the program, used by the mock for matching.
    pub(crate) fn program_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl fmt::Debug for ExecSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("envs", &self.envs)
            .field("working_dir", &self.working_dir)
            .field("check_exit", &self.check_exit)
            .field("stdout_line", &self.stdout_line.is_some())
            .field("stderr_line", &self.stderr_line.is_some())
            .finish()
    }
}

/// Spawns external processes and reports their exit.
///
/// Implementations must honor cancellation at every suspension point by
/// terminating the child and surfacing [`crate::Error::Cancelled`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run the described process to completion and return its exit code.
    async fn execute(&self, spec: ExecSpec, cancel: &CancellationToken) -> Result<i32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_uses_file_name() {
        let spec = ExecSpec::new("/opt/pg/bin/pg_ctl").args(["status", "-D", "/tmp/data"]);
        assert_eq!(spec.command_line(), "pg_ctl status -D /tmp/data");
    }

    #[test]
    fn captures_output_reflects_listeners() {
        let spec = ExecSpec::new("initdb");
        assert!(!spec.captures_output());
        let spec = spec.on_stderr(Arc::new(|_| {}));
        assert!(spec.captures_output());
    }

    #[test]
    fn no_throw_clears_check_exit() {
        let spec = ExecSpec::new("pg_ctl").no_throw();
        assert!(!spec.check_exit);
    }
}
