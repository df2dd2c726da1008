//! Sequential batch execution.
//!
//! Each prompt pair runs through the same steps: make sure the progress
//! subscription is live, patch the template, submit, wait for a terminal
//! event, download the artifacts and write them to disk. Any failure is
//! logged and recorded; the batch always moves on to the next item.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use comfybatch_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use comfybatch_comfyui::client::{new_client_id, ComfyUIClient};
use comfybatch_comfyui::events::TerminalStatus;
use comfybatch_comfyui::fetcher::{ArtifactFetcher, FetchReport};
use comfybatch_comfyui::monitor::ProgressMonitor;
use comfybatch_core::prompts::{preview, PromptPair};
use comfybatch_core::types::OutputFile;
use comfybatch_core::workflow::JobTemplate;

use crate::config::RunConfig;
use crate::error::ItemError;
use crate::summary::{ItemOutcome, RunSummary};

/// Characters of the positive prompt shown in progress logs.
const PREVIEW_CHARS: usize = 50;

/// Runs a list of prompt pairs against one ComfyUI server.
pub struct BatchRunner {
    template: JobTemplate,
    api: Arc<ComfyUIApi>,
    monitor: ProgressMonitor,
    fetcher: ArtifactFetcher,
    output_dir: PathBuf,
    job_timeout: Duration,
}

impl BatchRunner {
    /// Build a runner with a fresh client id. Nothing is contacted yet.
    pub fn new(template: JobTemplate, config: &RunConfig) -> Result<Self, ComfyUIApiError> {
        let api = Arc::new(ComfyUIApi::with_timeout(
            config.server.api_url.clone(),
            config.request_timeout,
        )?);
        let client = ComfyUIClient::new(config.server.ws_url.clone(), new_client_id());
        let monitor = ProgressMonitor::new(
            client,
            config.vocabulary.clone(),
            config.reconnect_backoff.clone(),
        );
        let fetcher = ArtifactFetcher::new(Arc::clone(&api), config.history_backoff.clone());

        Ok(Self {
            template,
            api,
            monitor,
            fetcher,
            output_dir: config.output_dir.clone(),
            job_timeout: config.job_timeout,
        })
    }

    /// Client id scoping this run's push notifications.
    pub fn client_id(&self) -> &str {
        self.monitor.client_id()
    }

    /// Process every prompt pair in order and summarise the outcome.
    ///
    /// Never fails as a whole: per-item errors end up in the summary.
    pub async fn run(&mut self, prompts: &[PromptPair]) -> RunSummary {
        let total = prompts.len();
        let mut summary = RunSummary::new(self.client_id(), total);

        tracing::info!(
            client_id = %self.client_id(),
            server = %self.api.api_url(),
            total,
            "Starting batch",
        );

        for (i, pair) in prompts.iter().enumerate() {
            tracing::info!(
                prompt_id = pair.id,
                "[{}/{}] {}",
                i + 1,
                total,
                preview(&pair.positive, PREVIEW_CHARS),
            );

            match self.process_item(pair).await {
                Ok(outcome) => {
                    tracing::info!(
                        prompt_id = pair.id,
                        files = outcome.written.len(),
                        "Prompt done",
                    );
                    summary.record_success(pair.id, outcome);
                }
                Err(e) => {
                    tracing::warn!(
                        prompt_id = pair.id,
                        kind = e.kind(),
                        error = %e,
                        "Skipping prompt",
                    );
                    summary.record_failure(pair.id, &e);
                }
            }
        }

        self.monitor.close().await;
        summary.finish();

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            files = summary.written.len(),
            "Batch finished",
        );
        summary
    }

    async fn process_item(&mut self, pair: &PromptPair) -> Result<ItemOutcome, ItemError> {
        // Listen before submitting so the job's first events are not missed.
        self.monitor.ensure_connected().await?;

        let graph = self.template.patch(&pair.positive, &pair.negative);
        let handle = self
            .api
            .submit(&graph, self.monitor.client_id())
            .await
            .map_err(ItemError::Submission)?;
        tracing::info!(
            prompt_id = pair.id,
            job_id = %handle.job_id,
            client_id = %handle.client_id,
            "Job queued",
        );

        let status = self
            .monitor
            .await_terminal(&handle.job_id, self.job_timeout)
            .await?;
        if status != TerminalStatus::Completed {
            return Err(ItemError::JobFailed {
                job_id: handle.job_id,
                status,
            });
        }

        let report = self.fetcher.fetch_with_retry(&handle.job_id).await?;
        self.write_outputs(pair, report).await
    }

    async fn write_outputs(
        &self,
        pair: &PromptPair,
        report: FetchReport,
    ) -> Result<ItemOutcome, ItemError> {
        let FetchReport {
            job_id,
            total,
            downloaded,
            failed,
        } = report;

        if downloaded.is_empty() {
            if let Some(first) = failed.into_iter().next() {
                return Err(ItemError::Download {
                    job_id,
                    count: total,
                    source: first,
                });
            }
            tracing::warn!(prompt_id = pair.id, job_id = %job_id, "Job produced no images");
            return Ok(ItemOutcome::default());
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| ItemError::Output {
                path: self.output_dir.clone(),
                source,
            })?;

        let mut written = Vec::with_capacity(downloaded.len());
        for item in downloaded {
            let file = OutputFile {
                prompt_id: pair.id,
                node_id: item.artifact.node_id,
                index: item.artifact.index,
                bytes: item.bytes,
            };
            let path = self.output_dir.join(file.filename());
            tokio::fs::write(&path, &file.bytes)
                .await
                .map_err(|source| ItemError::Output {
                    path: path.clone(),
                    source,
                })?;
            tracing::info!(prompt_id = pair.id, path = %path.display(), "Saved");
            written.push(path);
        }

        Ok(ItemOutcome {
            written,
            artifact_failures: failed.iter().map(ToString::to_string).collect(),
        })
    }
}
