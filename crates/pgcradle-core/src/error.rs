// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for pgcradle-core.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from orchestration operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A precondition on caller-supplied input does not hold.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// An external binary exited with a non-zero code.
    #[error("`{command}` exited with code {exit_code}: {message}")]
    CommandFailed {
        /// The invoked command line (program and arguments).
        command: String,
        /// Exit code reported by the child process.
        exit_code: i32,
        /// Captured stderr tail, or a generic message when output was not captured.
        message: String,
    },

    /// A filesystem operation failed, with the operation and target attached.
    #[error("{operation} failed for {}: {source}", path.display())]
    Fs {
        /// The operation that failed (e.g. "create directory").
        operation: &'static str,
        /// The path the operation targeted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A download exhausted its retry budget.
    #[error("Download of {url} failed after {attempts} attempts: {message}")]
    DownloadExhausted {
        /// The source URL.
        url: String,
        /// Total number of attempts made.
        attempts: u32,
        /// The last failure observed.
        message: String,
    },

    /// Zip archive read or write failed.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Archive processing failed outside the zip reader itself.
    #[error("Archive error: {0}")]
    Archive(String),

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// A wait expired before the expected condition held.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The environment lacks the controller required for the requested operation.
    #[error("Capability unavailable: the {0} binary is not present in this environment")]
    MissingCapability(&'static str),
}

/// Result type using pgcradle [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Attach operation and path context to an I/O error.
    pub(crate) fn fs(operation: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Error {
        let path = path.into();
        move |source| Error::Fs {
            operation,
            path,
            source,
        }
    }

    /// True when the error is transient from an HTTP perspective.
    pub(crate) fn is_transient_http(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Timeout(_) => true,
            _ => false,
        }
    }
}
