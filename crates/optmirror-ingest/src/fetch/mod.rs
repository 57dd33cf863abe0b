//! Resumable, size-verified fetcher
//!
//! Each catalog entry runs through a small state machine:
//!
//! 1. **Check** an already published `dest` against the declared size
//! 2. **Download** the body into `<dest>.partial`
//! 3. **Verify** the staged size with a tolerance (declared sizes are human-rounded)
//! 4. **Publish** by renaming the staging file onto `dest`
//!
//! Transport failures, retryable HTTP statuses and verification failures share one attempt
//! budget with exponential backoff between attempts. A file that exhausts its budget is
//! reported, never fatal to the batch.

pub mod backoff;

use futures::stream::{self, StreamExt};
use optmirror_common::units::{format_size, SizeTolerance};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::index::{Catalog, CatalogEntry};
use crate::progress::{create_download_progress, create_progress_bar, short_label};
use crate::staging::{discard_file, existing_len, publish, staging_path};
pub use backoff::ExponentialBackoff;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Transport error fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },

    #[error("{url} stalled: no data for {after:?}")]
    Stalled { url: String, after: Duration },

    #[error("Size mismatch for {url}: declared {declared} bytes, received {actual} bytes")]
    SizeMismatch {
        url: String,
        declared: u64,
        actual: u64,
    },

    #[error("Giving up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => !source.is_builder(),
            FetchError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            },
            FetchError::Stalled { .. } | FetchError::SizeMismatch { .. } => true,
            FetchError::Exhausted { .. } | FetchError::Io { .. } => false,
        }
    }

    /// Attempts made before this error was returned, when known
    pub fn attempts(&self) -> Option<u32> {
        match self {
            FetchError::Exhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
        move |source| FetchError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Retry and verification settings for the fetcher
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_jitter: Duration,
    /// Longest wait for response headers or for the next body chunk
    pub stall_timeout: Duration,
    pub tolerance: SizeTolerance,
    /// Re-download a published file that fails verification instead of only removing it
    pub redownload_corrupt: bool,
    pub show_progress: bool,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            max_jitter: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(120),
            tolerance: SizeTolerance::default(),
            redownload_corrupt: true,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Freshly downloaded and published; `replaced_corrupt` when a bad copy was removed first
    Downloaded { replaced_corrupt: bool },
    /// Already published with an acceptable size
    SkippedVerified,
    /// A published copy failed verification and was removed without re-downloading
    SkippedCorruptRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchReport {
    pub outcome: FetchOutcome,
    /// Download attempts made (0 when skipped)
    pub attempts: u32,
    /// Bytes written by this run
    pub bytes: u64,
}

impl FetchReport {
    fn skipped(outcome: FetchOutcome) -> Self {
        Self {
            outcome,
            attempts: 0,
            bytes: 0,
        }
    }
}

/// A file that could not be fetched
#[derive(Debug)]
pub struct FetchFailure {
    pub entry: CatalogEntry,
    pub error: FetchError,
}

/// Totals for a batch of fetches
#[derive(Debug, Default)]
pub struct FetchSummary {
    pub downloaded: usize,
    pub verified: usize,
    pub corrupt_removed: usize,
    /// Downloads that replaced a published copy which failed verification
    pub replaced_corrupt: usize,
    pub bytes: u64,
    pub failures: Vec<FetchFailure>,
}

impl FetchSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total(&self) -> usize {
        self.downloaded + self.verified + self.corrupt_removed + self.failures.len()
    }

    fn record(&mut self, entry: &CatalogEntry, result: Result<FetchReport, FetchError>) {
        match result {
            Ok(report) => {
                self.bytes += report.bytes;
                match report.outcome {
                    FetchOutcome::Downloaded { replaced_corrupt } => {
                        self.downloaded += 1;
                        if replaced_corrupt {
                            self.replaced_corrupt += 1;
                        }
                    },
                    FetchOutcome::SkippedVerified => self.verified += 1,
                    FetchOutcome::SkippedCorruptRemoved => self.corrupt_removed += 1,
                }
            },
            Err(error) => self.failures.push(FetchFailure {
                entry: entry.clone(),
                error,
            }),
        }
    }
}

/// Downloads catalog entries into the raw root
pub struct Fetcher {
    client: Client,
    policy: FetchPolicy,
}

impl Fetcher {
    pub fn new(client: Client, policy: FetchPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Bring `raw_root/<relative_path>` up to date for one entry
    pub async fn fetch(&self, entry: &CatalogEntry, raw_root: &Path) -> Result<FetchReport, FetchError> {
        let dest = entry.dest_path(raw_root);
        let staging = staging_path(&dest);
        let url = entry.url.as_str();

        // Check
        let mut replaced_corrupt = false;
        if let Some(actual) = existing_len(&dest).await.map_err(FetchError::io(&dest))? {
            if self.policy.tolerance.matches(entry.declared_size, actual) {
                debug!(path = %dest.display(), "Already fetched");
                return Ok(FetchReport::skipped(FetchOutcome::SkippedVerified));
            }

            warn!(
                path = %dest.display(),
                declared = entry.declared_size,
                actual,
                "Published file failed verification, removing"
            );
            discard_file(&dest).await.map_err(FetchError::io(&dest))?;
            if !self.policy.redownload_corrupt {
                return Ok(FetchReport::skipped(FetchOutcome::SkippedCorruptRemoved));
            }
            replaced_corrupt = true;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(FetchError::io(parent))?;
        }

        let mut backoff = ExponentialBackoff::new(
            self.policy.initial_backoff,
            self.policy.max_backoff,
            self.policy.max_jitter,
        );
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            // Download + Verify
            let result = self.download(entry, &staging).await;
            match result {
                Ok(bytes) => {
                    // Publish
                    publish(&staging, &dest).await.map_err(FetchError::io(&dest))?;
                    info!(
                        url,
                        path = %dest.display(),
                        size = %format_size(bytes),
                        attempt,
                        "Downloaded"
                    );
                    return Ok(FetchReport {
                        outcome: FetchOutcome::Downloaded { replaced_corrupt },
                        attempts: attempt,
                        bytes,
                    });
                },
                Err(error) => {
                    discard_file(&staging).await.map_err(FetchError::io(&staging))?;

                    if !error.is_transient() {
                        return Err(error);
                    }
                    if attempt >= self.policy.max_attempts {
                        return Err(FetchError::Exhausted {
                            url: url.to_string(),
                            attempts: attempt,
                            last: Box::new(error),
                        });
                    }

                    let delay = backoff.next_delay();
                    warn!(
                        url,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        retry_in = ?delay,
                        error = %error,
                        "Fetch attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    /// Stream the body into `staging` and verify its size; returns the bytes written
    async fn download(&self, entry: &CatalogEntry, staging: &Path) -> Result<u64, FetchError> {
        let url = entry.url.as_str();
        let stall = self.policy.stall_timeout;
        let stalled = || FetchError::Stalled {
            url: url.to_string(),
            after: stall,
        };
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };

        let response = tokio::time::timeout(stall, self.client.get(entry.url.clone()).send())
            .await
            .map_err(|_| stalled())?
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        let expected = response.content_length().unwrap_or(entry.declared_size);
        let label = short_label(&entry.relative_path.to_string_lossy(), 60);
        let pb = create_download_progress(expected, &label, self.policy.show_progress);

        // Truncates anything left by an interrupted run
        let mut file = tokio::fs::File::create(staging)
            .await
            .map_err(FetchError::io(staging))?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::time::timeout(stall, stream.next())
                .await
                .map_err(|_| stalled())?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(transport)?;
            file.write_all(&chunk).await.map_err(FetchError::io(staging))?;
            written += chunk.len() as u64;
            pb.set_position(written);
        }

        file.flush().await.map_err(FetchError::io(staging))?;
        file.sync_all().await.map_err(FetchError::io(staging))?;
        drop(file);
        pb.finish_and_clear();

        if !self.policy.tolerance.matches(entry.declared_size, written) {
            return Err(FetchError::SizeMismatch {
                url: url.to_string(),
                declared: entry.declared_size,
                actual: written,
            });
        }

        Ok(written)
    }

    /// Fetch every entry, `concurrency` at a time; failures are collected, not propagated
    pub async fn fetch_all(&self, catalog: &Catalog, raw_root: &Path, concurrency: usize) -> FetchSummary {
        let pb = create_progress_bar(catalog.len() as u64, "Fetching catalog", self.policy.show_progress);
        let mut summary = FetchSummary::default();

        let mut results = stream::iter(catalog.iter())
            .map(|entry| async move { (entry, self.fetch(entry, raw_root).await) })
            .buffer_unordered(concurrency.max(1));

        while let Some((entry, result)) = results.next().await {
            if let Err(error) = &result {
                warn!(
                    url = %entry.url,
                    path = %entry.relative_path.display(),
                    declared = entry.declared_size,
                    error = %error,
                    "Fetch failed permanently"
                );
            }
            summary.record(entry, result);
            pb.inc(1);
        }

        pb.finish_and_clear();
        info!(
            downloaded = summary.downloaded,
            verified = summary.verified,
            corrupt_removed = summary.corrupt_removed,
            failed = summary.failures.len(),
            bytes = %format_size(summary.bytes),
            "Fetch complete"
        );
        summary
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn status(code: u16) -> FetchError {
        FetchError::Status {
            url: "https://b.scsi.to/x.lz".to_string(),
            status: StatusCode::from_u16(code).unwrap(),
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(status(503).is_transient());
        assert!(status(500).is_transient());
        assert!(status(429).is_transient());
        assert!(status(408).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(403).is_transient());
    }

    #[test]
    fn test_exhausted_is_permanent() {
        let error = FetchError::Exhausted {
            url: "https://b.scsi.to/x.lz".to_string(),
            attempts: 8,
            last: Box::new(FetchError::SizeMismatch {
                url: "https://b.scsi.to/x.lz".to_string(),
                declared: 1_000_000,
                actual: 800_000,
            }),
        };
        assert!(!error.is_transient());
        assert_eq!(error.attempts(), Some(8));
        assert!(error.to_string().contains("800000"));
    }

    #[test]
    fn test_summary_counts() {
        let entry = CatalogEntry {
            url: url::Url::parse("https://b.scsi.to/x.lz").unwrap(),
            relative_path: PathBuf::from("x.lz"),
            declared_size: 10,
        };
        let mut summary = FetchSummary::default();
        summary.record(
            &entry,
            Ok(FetchReport {
                outcome: FetchOutcome::Downloaded { replaced_corrupt: true },
                attempts: 2,
                bytes: 10,
            }),
        );
        summary.record(&entry, Ok(FetchReport::skipped(FetchOutcome::SkippedVerified)));
        summary.record(&entry, Err(status(404)));

        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.replaced_corrupt, 1);
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.total(), 3);
        assert!(!summary.is_success());
    }
}
