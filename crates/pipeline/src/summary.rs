use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use comfybatch_core::types::PromptId;
use serde::Serialize;

use crate::error::ItemError;

/// A skipped item, or a single artifact that could not be downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub prompt_id: PromptId,
    pub kind: String,
    pub error: String,
}

/// What a successful item produced.
#[derive(Debug, Clone, Default)]
pub struct ItemOutcome {
    pub written: Vec<PathBuf>,
    /// Downloads that failed while others of the same job succeeded.
    pub artifact_failures: Vec<String>,
}

/// Result of a whole batch run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub client_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub written: Vec<PathBuf>,
    pub failures: Vec<ItemFailure>,
    pub artifact_failures: Vec<ItemFailure>,
}

impl RunSummary {
    pub fn new(client_id: impl Into<String>, total: usize) -> Self {
        let now = Utc::now();
        Self {
            client_id: client_id.into(),
            started_at: now,
            finished_at: now,
            total,
            succeeded: 0,
            failed: 0,
            written: Vec::new(),
            failures: Vec::new(),
            artifact_failures: Vec::new(),
        }
    }

    pub fn record_success(&mut self, prompt_id: PromptId, outcome: ItemOutcome) {
        self.succeeded += 1;
        self.written.extend(outcome.written);
        self.artifact_failures
            .extend(outcome.artifact_failures.into_iter().map(|error| ItemFailure {
                prompt_id,
                kind: "download".to_string(),
                error,
            }));
    }

    pub fn record_failure(&mut self, prompt_id: PromptId, error: &ItemError) {
        self.failed += 1;
        self.failures.push(ItemFailure {
            prompt_id,
            kind: error.kind().to_string(),
            error: error.to_string(),
        });
    }

    /// Stamp the end time.
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Write the summary as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)
    }
}
