// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scripted executor for tests and downstream harnesses.
//!
//! Responses are queued per binary name; every invocation is recorded so
//! tests can assert the exact argument vectors that were built.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{CommandExecutor, ExecSpec};
use crate::error::{Error, Result};

/// One scripted child-process outcome.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    /// Exit code to report.
    pub exit_code: i32,
    /// Lines delivered to a registered stdout listener.
    pub stdout: Vec<String>,
    /// Lines delivered to a registered stderr listener.
    pub stderr: Vec<String>,
}

impl MockResponse {
    /// A successful exit with the given stdout lines.
    pub fn ok(stdout: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into_iter().map(Into::into).collect(),
            stderr: Vec::new(),
        }
    }

    /// A failed exit with the given code.
    pub fn exit(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }
}

/// A recorded invocation.
#[derive(Debug, Clone)]
pub struct RecordedCommand {
    /// Binary file name (e.g. `pg_ctl`).
    pub program: String,
    /// Argument vector as passed.
    pub args: Vec<String>,
    /// Child-only environment variables.
    pub envs: HashMap<String, String>,
}

/// Executor that consumes scripted responses instead of spawning.
#[derive(Debug, Default)]
pub struct MockCommandExecutor {
    responses: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    recorded: Mutex<Vec<RecordedCommand>>,
}

impl MockCommandExecutor {
    /// Create an empty mock; unscripted binaries exit zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next invocation of `program`.
    pub fn enqueue(&self, program: impl Into<String>, response: MockResponse) {
        self.responses
            .lock()
            .expect("mock response lock")
            .entry(program.into())
            .or_default()
            .push_back(response);
    }

    /// All invocations recorded so far, in order.
    pub fn recorded(&self) -> Vec<RecordedCommand> {
        self.recorded.lock().expect("mock record lock").clone()
    }

    /// Invocations of one binary, in order.
    pub fn recorded_for(&self, program: &str) -> Vec<RecordedCommand> {
        self.recorded()
            .into_iter()
            .filter(|r| r.program == program)
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for MockCommandExecutor {
    async fn execute(&self, spec: ExecSpec, cancel: &CancellationToken) -> Result<i32> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let program = spec.program_name();
        self.recorded.lock().expect("mock record lock").push(RecordedCommand {
            program: program.clone(),
            args: spec.args.clone(),
            envs: spec.envs.clone(),
        });

        let response = self
            .responses
            .lock()
            .expect("mock response lock")
            .get_mut(&program)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();

        if let Some(handler) = &spec.stdout_line {
            for line in &response.stdout {
                handler(line);
            }
        }
        if let Some(handler) = &spec.stderr_line {
            for line in &response.stderr {
                handler(line);
            }
        }

        if response.exit_code != 0 && spec.check_exit {
            return Err(Error::CommandFailed {
                command: spec.command_line(),
                exit_code: response.exit_code,
                message: response.stderr.join("\n"),
            });
        }
        Ok(response.exit_code)
    }
}
