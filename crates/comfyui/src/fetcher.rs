//! Downloads the files a finished job produced.
//!
//! The terminal event can arrive before ComfyUI has flushed the job's
//! history entry, so [`ArtifactFetcher::fetch_with_retry`] polls history
//! with bounded backoff while the entry is missing.

use std::sync::Arc;
use std::time::Duration;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::backoff::{retry_with_backoff, BackoffConfig};
use crate::history::{extract_artifacts, ArtifactRef};

/// Backoff used while waiting for a job's history entry to appear.
pub fn default_history_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(5),
        multiplier: 2.0,
        max_attempts: 5,
    }
}

/// One artifact and its downloaded content.
#[derive(Debug, Clone)]
pub struct DownloadedArtifact {
    pub artifact: ArtifactRef,
    pub bytes: Vec<u8>,
}

/// Outcome of fetching every artifact of one job.
///
/// A failed download does not abort the rest; it is recorded in
/// `failed` and the remaining artifacts are still attempted.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub job_id: String,
    /// Number of artifacts listed in history.
    pub total: usize,
    pub downloaded: Vec<DownloadedArtifact>,
    pub failed: Vec<FetchError>,
}

impl FetchReport {
    /// True when history listed artifacts but none could be downloaded.
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.downloaded.is_empty()
    }
}

/// Errors from history lookup and artifact download.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("No history recorded for job {job_id}")]
    HistoryNotFound { job_id: String },

    #[error("Failed to read history for job {job_id}: {source}")]
    History {
        job_id: String,
        #[source]
        source: ComfyUIApiError,
    },

    #[error("Failed to download {filename} from node {node_id}: {source}")]
    Download {
        node_id: String,
        filename: String,
        #[source]
        source: ComfyUIApiError,
    },
}

/// Lists and downloads job artifacts over the ComfyUI REST API.
pub struct ArtifactFetcher {
    api: Arc<ComfyUIApi>,
    history_backoff: BackoffConfig,
}

impl ArtifactFetcher {
    pub fn new(api: Arc<ComfyUIApi>, history_backoff: BackoffConfig) -> Self {
        Self {
            api,
            history_backoff,
        }
    }

    /// Read the job's history once and list its image artifacts.
    pub async fn list_artifacts(&self, job_id: &str) -> Result<Vec<ArtifactRef>, FetchError> {
        let history = self
            .api
            .get_history(job_id)
            .await
            .map_err(|source| FetchError::History {
                job_id: job_id.to_string(),
                source,
            })?;

        extract_artifacts(&history, job_id)
    }

    /// List artifacts once and download each of them.
    ///
    /// Fails only when history itself cannot be read; individual
    /// download failures are collected in the report.
    pub async fn fetch(&self, job_id: &str) -> Result<FetchReport, FetchError> {
        let artifacts = self.list_artifacts(job_id).await?;
        Ok(self.download_all(job_id, artifacts).await)
    }

    /// Like [`fetch`](Self::fetch), but retries while the history entry
    /// is not there yet. Transport errors are not retried.
    pub async fn fetch_with_retry(&self, job_id: &str) -> Result<FetchReport, FetchError> {
        let artifacts = retry_with_backoff(
            &self.history_backoff,
            "History lookup",
            |e: &FetchError| matches!(e, FetchError::HistoryNotFound { .. }),
            |_| self.list_artifacts(job_id),
        )
        .await?;

        Ok(self.download_all(job_id, artifacts).await)
    }

    async fn download_all(&self, job_id: &str, artifacts: Vec<ArtifactRef>) -> FetchReport {
        let mut report = FetchReport {
            job_id: job_id.to_string(),
            total: artifacts.len(),
            ..Default::default()
        };

        for artifact in artifacts {
            match self.api.view(&artifact).await {
                Ok(bytes) => {
                    tracing::debug!(
                        job_id,
                        node_id = %artifact.node_id,
                        filename = %artifact.filename,
                        size = bytes.len(),
                        "Downloaded artifact",
                    );
                    report.downloaded.push(DownloadedArtifact { artifact, bytes });
                }
                Err(source) => {
                    tracing::warn!(
                        job_id,
                        node_id = %artifact.node_id,
                        filename = %artifact.filename,
                        error = %source,
                        "Artifact download failed",
                    );
                    report.failed.push(FetchError::Download {
                        node_id: artifact.node_id,
                        filename: artifact.filename,
                        source,
                    });
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_failed_needs_listed_artifacts() {
        let empty = FetchReport::default();
        assert!(!empty.all_failed());

        let report = FetchReport {
            job_id: "abc".into(),
            total: 2,
            ..Default::default()
        };
        assert!(report.all_failed());
    }

    #[test]
    fn history_backoff_is_bounded() {
        let backoff = default_history_backoff();
        assert_eq!(backoff.max_attempts, 5);
        assert!(backoff.max_delay <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unreachable_history_is_not_retried() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let api = ComfyUIApi::with_timeout(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        let fetcher = ArtifactFetcher::new(Arc::new(api), default_history_backoff());

        let started = std::time::Instant::now();
        let result = fetcher.fetch_with_retry("abc").await;
        assert!(matches!(result, Err(FetchError::History { .. })));
        // No backoff sleep was taken.
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
