// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process executor backed by `tokio::process`.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CommandExecutor, ExecSpec, LineHandler};
use crate::error::{Error, Result};

/// How many trailing stderr lines are kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Executes commands as real child processes on the host.
#[derive(Debug, Default, Clone)]
pub struct NativeCommandExecutor;

impl NativeCommandExecutor {
    /// Create a new native executor.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for NativeCommandExecutor {
    async fn execute(&self, spec: ExecSpec, cancel: &CancellationToken) -> Result<i32> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        debug!(command = %spec.command_line(), capture = spec.captures_output(), "Spawning process");

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        command.envs(&spec.envs);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        command.stdin(Stdio::null());
        command.kill_on_drop(true);

        if spec.captures_output() {
            execute_streaming(command, &spec, cancel).await
        } else {
            execute_detached(command, &spec, cancel).await
        }
    }
}

/// Capture-free path: completion only. Required for children that hold
/// their output handles open past our wait (the postmaster does).
async fn execute_detached(
    mut command: Command,
    spec: &ExecSpec,
    cancel: &CancellationToken,
) -> Result<i32> {
    command.stdout(Stdio::null());
    command.stderr(Stdio::null());

    let mut child = command
        .spawn()
        .map_err(Error::fs("spawn", spec.program.clone()))?;

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            warn!(command = %spec.command_line(), "Cancelled, killing child");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(Error::Cancelled);
        }
    };

    finish(spec, status.code().unwrap_or(-1), None)
}

/// Streaming path: stdout/stderr are piped and delivered line-by-line.
async fn execute_streaming(
    mut command: Command,
    spec: &ExecSpec,
    cancel: &CancellationToken,
) -> Result<i32> {
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(Error::fs("spawn", spec.program.clone()))?;

    let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let stdout_task = tokio::spawn(pump_lines(
        stdout,
        spec.stdout_line.clone(),
        None,
        cancel.clone(),
    ));
    let stderr_task = tokio::spawn(pump_lines(
        stderr,
        spec.stderr_line.clone(),
        Some(stderr_tail.clone()),
        cancel.clone(),
    ));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            warn!(command = %spec.command_line(), "Cancelled, killing child");
            let _ = child.start_kill();
            let _ = child.wait().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(Error::Cancelled);
        }
    };

    // Drain the pipes so trailing output is delivered before we report.
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let tail: Vec<String> = stderr_tail.lock().expect("stderr tail lock").iter().cloned().collect();
    finish(spec, status.code().unwrap_or(-1), Some(tail))
}

/// Read lines from a child pipe, forwarding each to the handler and
/// keeping a bounded tail when requested.
async fn pump_lines<R: AsyncRead + Unpin>(
    pipe: R,
    handler: Option<LineHandler>,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if cancel.is_cancelled() {
            break;
        }
        if let Some(tail) = &tail {
            let mut tail = tail.lock().expect("stderr tail lock");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        if let Some(handler) = &handler {
            handler(&line);
        }
    }
}

fn finish(spec: &ExecSpec, exit_code: i32, stderr_tail: Option<Vec<String>>) -> Result<i32> {
    if exit_code != 0 && spec.check_exit {
        let message = match stderr_tail {
            Some(tail) if !tail.is_empty() => tail.join("\n"),
            _ => "process exited with a non-zero status".to_string(),
        };
        return Err(Error::CommandFailed {
            command: spec.command_line(),
            exit_code,
            message,
        });
    }
    debug!(command = %spec.command_line(), exit_code, "Process finished");
    Ok(exit_code)
}
