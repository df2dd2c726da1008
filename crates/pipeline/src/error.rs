use std::path::PathBuf;

use comfybatch_comfyui::api::ComfyUIApiError;
use comfybatch_comfyui::events::TerminalStatus;
use comfybatch_comfyui::fetcher::FetchError;
use comfybatch_comfyui::monitor::MonitorError;

/// Why one batch item was skipped.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error("Submission failed: {0}")]
    Submission(#[source] ComfyUIApiError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("Job {job_id} {status}")]
    JobFailed {
        job_id: String,
        status: TerminalStatus,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("All {count} downloads failed for job {job_id}: {source}")]
    Download {
        job_id: String,
        count: usize,
        #[source]
        source: FetchError,
    },

    #[error("Failed to write {}: {source}", .path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ItemError {
    /// Stable short name for summaries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::Submission(_) | ItemError::Monitor(MonitorError::Unreachable(_)) => {
                "submission"
            }
            ItemError::Monitor(MonitorError::Timeout { .. }) => "timeout",
            ItemError::Monitor(MonitorError::ConnectionLost { .. } | MonitorError::Connect(_)) => {
                "connection_lost"
            }
            ItemError::JobFailed { .. } => "job_failed",
            ItemError::Fetch(FetchError::HistoryNotFound { .. }) => "history_not_found",
            ItemError::Fetch(FetchError::History { .. }) => "history",
            ItemError::Fetch(FetchError::Download { .. }) | ItemError::Download { .. } => "download",
            ItemError::Output { .. } => "output",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use comfybatch_comfyui::client::ComfyUIClientError;
    use comfybatch_comfyui::monitor::JobState;

    use super::*;

    #[test]
    fn kinds() {
        let timeout = ItemError::from(MonitorError::Timeout {
            job_id: "abc".into(),
            timeout: Duration::from_secs(1),
            last_state: JobState::Queued,
        });
        assert_eq!(timeout.kind(), "timeout");

        let lost = ItemError::from(MonitorError::ConnectionLost {
            job_id: "abc".into(),
        });
        assert_eq!(lost.kind(), "connection_lost");

        let refused = ItemError::from(MonitorError::Unreachable(ComfyUIClientError::Connection(
            "Connection refused".into(),
        )));
        assert_eq!(refused.kind(), "submission");

        let missing = ItemError::from(FetchError::HistoryNotFound {
            job_id: "abc".into(),
        });
        assert_eq!(missing.kind(), "history_not_found");
    }

    #[test]
    fn job_failed_carries_server_message() {
        let err = ItemError::JobFailed {
            job_id: "abc".into(),
            status: TerminalStatus::Errored {
                node_id: Some("3".into()),
                message: "RuntimeError: CUDA out of memory".into(),
            },
        };
        assert_eq!(
            err.to_string(),
            "Job abc errored at node 3: RuntimeError: CUDA out of memory"
        );
        assert_eq!(err.kind(), "job_failed");
    }
}
