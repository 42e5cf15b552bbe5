// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP artifact download with retry and a shared cache discipline.
//!
//! Destination names are derived deterministically from the URL, and
//! an existing file short-circuits the download, so a cache directory
//! is safe to share across concurrent builds.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fs::{FileSystem, sanitize_filename};

/// Default cap on the whole download, retries included.
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(600);

/// Response codes worth another attempt.
const RETRYABLE_STATUS: &[StatusCode] = &[
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::LOCKED,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Hook receiving `(failure, delay, attempt)` before each retry sleep.
pub type RetryHook = Arc<dyn Fn(&Error, Duration, u32) + Send + Sync>;

/// Delay schedule between attempts.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Retry behavior for transient HTTP failures.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Cap on one attempt.
    pub attempt_timeout: Duration,
    /// Cap on the whole operation, retries included.
    pub total_timeout: Duration,
    /// Delay before retry `attempt` (1-based).
    pub backoff: BackoffFn,
    /// Observer invoked per retry.
    pub on_retry: Option<RetryHook>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            attempt_timeout: Duration::from_secs(120),
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
            backoff: Arc::new(|attempt| Duration::from_secs(2u64.pow(attempt.min(10)))),
            on_retry: None,
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("total_timeout", &self.total_timeout)
            .finish()
    }
}

impl RetryPolicy {
    /// True when `error` is worth another attempt.
    pub fn is_retryable(&self, error: &Error) -> bool {
        match error {
            Error::DownloadExhausted { .. } | Error::Cancelled => false,
            Error::Http(e) => match e.status() {
                Some(status) => RETRYABLE_STATUS.contains(&status),
                None => e.is_timeout() || e.is_connect() || e.is_request(),
            },
            other => other.is_transient_http(),
        }
    }
}

/// Streaming downloader over a shared cache directory.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    fs: FileSystem,
    policy: RetryPolicy,
}

impl HttpDownloader {
    /// Create a downloader with the default retry policy.
    pub fn new(fs: FileSystem) -> Self {
        Self::with_policy(fs, RetryPolicy::default())
    }

    /// Create a downloader with an explicit retry policy.
    pub fn with_policy(fs: FileSystem, policy: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(policy.attempt_timeout)
            .build()
            .expect("HTTP client construction cannot fail with static options");
        Self { client, fs, policy }
    }

    /// Download `url` into `directory` and return the local path.
    ///
    /// The file name is caller-supplied or derived from the URL via the
    /// filename sanitizer, so the same URL always lands on the same
    /// path. An existing file is returned as-is unless `force` is set.
    pub async fn download(
        &self,
        url: &str,
        directory: &Path,
        file_name: Option<&str>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let name = match file_name {
            Some(name) => name.to_string(),
            None => sanitize_filename(url),
        };
        self.fs.ensure_directory(directory).await?;
        let destination = directory.join(&name);
        self.fs.require_not_directory(&destination).await?;

        match self.fs.path_kind(&destination).await? {
            crate::fs::PathKind::File if !force => {
                debug!(url, path = %destination.display(), "Already cached, skipping download");
                return Ok(destination);
            }
            crate::fs::PathKind::File => self.fs.delete_file(&destination).await?,
            _ => {}
        }

        let result = tokio::time::timeout(
            self.policy.total_timeout,
            self.download_with_retries(url, &destination, cancel),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                info!(url, path = %destination.display(), "Downloaded");
                Ok(destination)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.fs.delete_file(&destination).await?;
                Err(Error::Timeout(format!("download of {url}")))
            }
        }
    }

    async fn download_with_retries(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut last_failure = String::new();
        for attempt in 0..=self.policy.max_retries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.attempt(url, destination, cancel).await {
                Ok(()) => return Ok(()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if self.policy.is_retryable(&e) && attempt < self.policy.max_retries => {
                    let delay = (self.policy.backoff)(attempt + 1);
                    warn!(
                        url,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Transient download failure, will retry"
                    );
                    if let Some(hook) = &self.policy.on_retry {
                        hook(&e, delay, attempt + 1);
                    }
                    self.fs.delete_file(destination).await?;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                    last_failure = e.to_string();
                }
                Err(e) if self.policy.is_retryable(&e) => {
                    last_failure = e.to_string();
                }
                Err(e) => {
                    self.fs.delete_file(destination).await?;
                    return Err(e);
                }
            }
        }
        self.fs.delete_file(destination).await?;
        Err(Error::DownloadExhausted {
            url: url.to_string(),
            attempts: self.policy.max_retries + 1,
            message: last_failure,
        })
    }

    async fn attempt(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let response = tokio::select! {
            response = self.client.get(url).send() => response?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let response = response.error_for_status()?;

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(Error::fs("create file", destination))?;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };
            match chunk {
                Some(chunk) => {
                    let chunk = chunk?;
                    file.write_all(&chunk)
                        .await
                        .map_err(Error::fs("write file", destination))?;
                }
                None => break,
            }
        }
        file.flush()
            .await
            .map_err(Error::fs("write file", destination))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!((policy.backoff)(1), Duration::from_secs(2));
        assert_eq!((policy.backoff)(2), Duration::from_secs(4));
        assert_eq!((policy.backoff)(3), Duration::from_secs(8));
    }

    #[test]
    fn cancellation_is_never_retryable() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_retryable(&Error::Cancelled));
    }

    #[test]
    fn timeouts_are_retryable() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&Error::Timeout("request".into())));
    }

    #[test]
    fn validation_failures_are_not_retryable() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_retryable(&Error::Validation("bad input".into())));
    }

    #[tokio::test]
    async fn existing_file_short_circuits_without_force() {
        let temp = TempDir::new().unwrap();
        let fs = FileSystem::new();
        let downloader = HttpDownloader::new(fs);

        let name = "cached.zip";
        tokio::fs::write(temp.path().join(name), b"bytes").await.unwrap();

        // The URL is unreachable; the cached file must win before any I/O.
        let path = downloader
            .download(
                "http://127.0.0.1:1/unreachable.zip",
                temp.path(),
                Some(name),
                false,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(path, temp.path().join(name));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"bytes");
    }

    #[tokio::test]
    async fn destination_directory_is_rejected() {
        let temp = TempDir::new().unwrap();
        let downloader = HttpDownloader::new(FileSystem::new());
        tokio::fs::create_dir(temp.path().join("taken")).await.unwrap();

        let err = downloader
            .download(
                "http://127.0.0.1:1/x.zip",
                temp.path(),
                Some("taken"),
                false,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let temp = TempDir::new().unwrap();
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Arc::new(|_| Duration::from_millis(1)),
            on_retry: Some(Arc::new(move |_, _, attempt| {
                seen.fetch_max(attempt, Ordering::SeqCst);
            })),
            ..RetryPolicy::default()
        };
        let downloader = HttpDownloader::with_policy(FileSystem::new(), policy);

        // Nothing listens on this port, so every attempt fails to connect.
        let err = downloader
            .download(
                "http://127.0.0.1:1/artifact.zip",
                temp.path(),
                None,
                false,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            Error::DownloadExhausted { attempts: total, .. } => assert_eq!(total, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        // With N retries, at most N hook calls and N+1 attempts.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn derived_name_is_url_stable() {
        let temp = TempDir::new().unwrap();
        let fs = FileSystem::new();
        let downloader = HttpDownloader::new(fs.clone());

        let url = "https://repo1.maven.org/io/zonky/postgres-linux-amd64.jar";
        let expected = temp.path().join(sanitize_filename(url));
        tokio::fs::write(&expected, b"jar").await.unwrap();

        let path = downloader
            .download(url, temp.path(), None, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, expected);
    }
}
