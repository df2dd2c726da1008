//! Job progress tracking over the ComfyUI push channel.
//!
//! [`ProgressMonitor`] owns one WebSocket subscription for the whole run.
//! A background task reads frames, turns them into [`ProgressEvent`]s
//! and buffers them in a channel, so events that arrive while the
//! caller is busy (submitting, downloading) are not lost. Waiting on a
//! single job is done by feeding those events through a [`JobTracker`].

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::backoff::{retry_with_backoff, BackoffConfig};
use crate::client::{ComfyUIClient, ComfyUIClientError, WsStream};
use crate::events::{EventVocabulary, ProgressEvent, TerminalStatus};
use crate::messages::parse_message;

/// Buffered events between the reader task and the waiting caller.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of one submitted job as seen through push events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Queued,
    Executing,
    Completed,
    Errored,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Errored | JobState::Cancelled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Submitted => "submitted",
            JobState::Queued => "queued",
            JobState::Executing => "executing",
            JobState::Completed => "completed",
            JobState::Errored => "errored",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// State machine for a single job.
///
/// Events scoped to other jobs are ignored. Once a terminal status is
/// reached it never changes.
#[derive(Debug, Clone)]
pub struct JobTracker {
    job_id: String,
    state: JobState,
    current_node: Option<String>,
    terminal: Option<TerminalStatus>,
}

impl JobTracker {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Submitted,
            current_node: None,
            terminal: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Node the server last reported as executing.
    pub fn current_node(&self) -> Option<&str> {
        self.current_node.as_deref()
    }

    /// Feed one event. Returns the terminal status once the job is done.
    pub fn apply(&mut self, event: &ProgressEvent) -> Option<TerminalStatus> {
        if let Some(status) = &self.terminal {
            return Some(status.clone());
        }
        if event.prompt_id().is_some_and(|id| id != self.job_id) {
            return None;
        }

        match event {
            ProgressEvent::QueueStatus { queue_remaining } => {
                if self.state == JobState::Submitted {
                    self.state = JobState::Queued;
                }
                tracing::debug!(job_id = %self.job_id, queue_remaining, "Queue status");
            }
            ProgressEvent::ExecutionStarted { .. } => {
                self.state = JobState::Executing;
                tracing::debug!(job_id = %self.job_id, "Execution started");
            }
            ProgressEvent::NodeExecuting { node, .. } => {
                self.state = JobState::Executing;
                self.current_node = Some(node.clone());
                tracing::debug!(job_id = %self.job_id, node = %node, "Executing node");
            }
            ProgressEvent::NodeProgress {
                prompt_id,
                value,
                max,
                ..
            } => {
                // Unscoped progress can only be attributed to a job that is running.
                if prompt_id.is_none() && self.state != JobState::Executing {
                    return None;
                }
                self.state = JobState::Executing;
                let percent = if *max > 0 { value * 100 / max } else { 0 };
                tracing::trace!(job_id = %self.job_id, value, max, percent, "Generation progress");
            }
            ProgressEvent::Finished { .. } => {
                return Some(self.finish(JobState::Completed, TerminalStatus::Completed));
            }
            ProgressEvent::Errored {
                node_id, message, ..
            } => {
                let status = TerminalStatus::Errored {
                    node_id: node_id.clone(),
                    message: message.clone(),
                };
                return Some(self.finish(JobState::Errored, status));
            }
            ProgressEvent::Cancelled { .. } => {
                return Some(self.finish(JobState::Cancelled, TerminalStatus::Cancelled));
            }
            ProgressEvent::Other { kind, .. } => {
                tracing::trace!(job_id = %self.job_id, kind = %kind, "Ignoring event");
            }
        }
        None
    }

    fn finish(&mut self, state: JobState, status: TerminalStatus) -> TerminalStatus {
        self.state = state;
        self.terminal = Some(status.clone());
        status
    }
}

/// Errors while waiting for a job to finish.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Job {job_id} did not finish within {timeout:?} (last state: {last_state})")]
    Timeout {
        job_id: String,
        timeout: Duration,
        last_state: JobState,
    },

    #[error("Progress connection lost while waiting for job {job_id}")]
    ConnectionLost { job_id: String },

    /// The server refused the first connection of the run.
    #[error("ComfyUI server unreachable: {0}")]
    Unreachable(#[source] ComfyUIClientError),

    /// Reconnecting after a dropped subscription ran out of attempts.
    #[error(transparent)]
    Connect(#[from] ComfyUIClientError),
}

/// Drain `events` into `tracker` until it reports a terminal status.
///
/// Fails with [`MonitorError::Timeout`] once `timeout` has elapsed and
/// with [`MonitorError::ConnectionLost`] when the channel closes.
pub async fn wait_for_terminal(
    events: &mut mpsc::Receiver<ProgressEvent>,
    tracker: &mut JobTracker,
    timeout: Duration,
) -> Result<TerminalStatus, MonitorError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => {
                if let Some(status) = tracker.apply(&event) {
                    return Ok(status);
                }
            }
            Ok(None) => {
                return Err(MonitorError::ConnectionLost {
                    job_id: tracker.job_id().to_string(),
                })
            }
            Err(_) => {
                return Err(MonitorError::Timeout {
                    job_id: tracker.job_id().to_string(),
                    timeout,
                    last_state: tracker.state(),
                })
            }
        }
    }
}

/// A live WebSocket reader task and the channel it feeds.
struct Subscription {
    events: mpsc::Receiver<ProgressEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The run's single progress subscription.
pub struct ProgressMonitor {
    client: ComfyUIClient,
    vocabulary: Arc<EventVocabulary>,
    reconnect: BackoffConfig,
    subscription: Option<Subscription>,
    connected_once: bool,
}

impl ProgressMonitor {
    /// Create an unconnected monitor. Nothing is opened until
    /// [`ensure_connected`](Self::ensure_connected) or
    /// [`await_terminal`](Self::await_terminal) is called.
    pub fn new(client: ComfyUIClient, vocabulary: EventVocabulary, reconnect: BackoffConfig) -> Self {
        Self {
            client,
            vocabulary: Arc::new(vocabulary),
            reconnect,
            subscription: None,
            connected_once: false,
        }
    }

    pub fn client_id(&self) -> &str {
        self.client.client_id()
    }

    /// Whether the reader task is still running.
    pub fn is_connected(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|sub| !sub.task.is_finished())
    }

    /// Open the subscription if it is not live.
    ///
    /// The first connection of the run is tried once, so a dead server
    /// fails with [`MonitorError::Unreachable`] right away. Reopening a
    /// subscription that was live before retries with backoff.
    ///
    /// Call this before submitting a job so that none of its events are
    /// sent before the socket is listening.
    pub async fn ensure_connected(&mut self) -> Result<(), MonitorError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.subscription.take().is_some() {
            tracing::info!(client_id = %self.client.client_id(), "Progress subscription dropped, reconnecting");
        }

        let ws_stream = if self.connected_once {
            let client = &self.client;
            retry_with_backoff(
                &self.reconnect,
                "ComfyUI WebSocket connect",
                |_: &ComfyUIClientError| true,
                |_| client.connect(),
            )
            .await?
        } else {
            self.client.connect().await.map_err(MonitorError::Unreachable)?
        };
        self.connected_once = true;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_events(
            ws_stream,
            Arc::clone(&self.vocabulary),
            tx,
            cancel.clone(),
        ));

        self.subscription = Some(Subscription {
            events: rx,
            cancel,
            task,
        });
        Ok(())
    }

    /// Wait until `job_id` reaches a terminal status or `timeout` elapses.
    ///
    /// Events already buffered for other jobs are skipped. A lost
    /// connection drops the subscription; the next
    /// [`ensure_connected`](Self::ensure_connected) reopens it.
    pub async fn await_terminal(
        &mut self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<TerminalStatus, MonitorError> {
        if self.subscription.is_none() {
            self.ensure_connected().await?;
        }
        let Some(subscription) = self.subscription.as_mut() else {
            return Err(MonitorError::ConnectionLost {
                job_id: job_id.to_string(),
            });
        };

        let mut tracker = JobTracker::new(job_id);
        let result = wait_for_terminal(&mut subscription.events, &mut tracker, timeout).await;

        if matches!(result, Err(MonitorError::ConnectionLost { .. })) {
            self.subscription = None;
        }
        result
    }

    /// Close the WebSocket and wait for the reader task to exit.
    pub async fn close(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.cancel.cancel();
            if let Err(e) = (&mut subscription.task).await {
                tracing::warn!(error = %e, "Progress reader task failed");
            }
        }
    }
}

/// Read frames until the socket closes or `cancel` fires, forwarding
/// every recognised event to `tx`.
async fn forward_events(
    ws_stream: WsStream,
    vocabulary: Arc<EventVocabulary>,
    tx: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = sink.close().await {
                    tracing::debug!(error = %e, "WebSocket close failed");
                }
                break;
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = interpret(&text, &vocabulary) {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        // Preview images.
                        tracing::trace!(size = data.len(), "Ignoring binary message");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "ComfyUI WebSocket closed");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong handled by tungstenite.
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

fn interpret(text: &str, vocabulary: &EventVocabulary) -> Option<ProgressEvent> {
    let raw = match parse_message(text) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, raw_message = %text, "Failed to parse ComfyUI message");
            return None;
        }
    };

    match vocabulary.classify(&raw) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(kind = %raw.kind, error = %e, "Unexpected payload for ComfyUI event");
            None
        }
    }
}
