//! Typed progress events and the server event-name vocabulary.
//!
//! Event type strings differ between ComfyUI releases, so the mapping
//! from a [`RawMessage`] to a [`ProgressEvent`] is driven by an
//! [`EventVocabulary`] instead of being hardcoded.

use serde::Serialize;

use crate::messages::{
    ErrorData, ExecutingData, InterruptedData, ProgressData, PromptScopedData, RawMessage,
    StatusData,
};

/// Final state of a job's execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Errored {
        node_id: Option<String>,
        message: String,
    },
    Cancelled,
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalStatus::Completed => f.write_str("completed"),
            TerminalStatus::Errored { node_id: Some(node), message } => {
                write!(f, "errored at node {node}: {message}")
            }
            TerminalStatus::Errored { node_id: None, message } => write!(f, "errored: {message}"),
            TerminalStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A server push event, interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Queue depth changed. Not scoped to a job.
    QueueStatus { queue_remaining: i32 },
    ExecutionStarted { prompt_id: String },
    NodeExecuting { prompt_id: String, node: String },
    NodeProgress {
        prompt_id: Option<String>,
        node: Option<String>,
        value: i32,
        max: i32,
    },
    Finished { prompt_id: String },
    Errored {
        prompt_id: String,
        node_id: Option<String>,
        message: String,
    },
    Cancelled { prompt_id: String },
    /// Anything the vocabulary does not name.
    Other {
        kind: String,
        prompt_id: Option<String>,
    },
}

impl ProgressEvent {
    /// Job this event belongs to, when the server says so.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ProgressEvent::QueueStatus { .. } => None,
            ProgressEvent::ExecutionStarted { prompt_id }
            | ProgressEvent::NodeExecuting { prompt_id, .. }
            | ProgressEvent::Finished { prompt_id }
            | ProgressEvent::Errored { prompt_id, .. }
            | ProgressEvent::Cancelled { prompt_id } => Some(prompt_id.as_str()),
            ProgressEvent::NodeProgress { prompt_id, .. }
            | ProgressEvent::Other { prompt_id, .. } => prompt_id.as_deref(),
        }
    }
}

/// Event type strings understood by the progress monitor.
///
/// `executing` messages with a null node also count as "finished".
#[derive(Debug, Clone)]
pub struct EventVocabulary {
    pub status: Vec<String>,
    pub started: Vec<String>,
    pub executing: Vec<String>,
    pub progress: Vec<String>,
    pub finished: Vec<String>,
    pub errored: Vec<String>,
    pub cancelled: Vec<String>,
}

impl Default for EventVocabulary {
    fn default() -> Self {
        fn names(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }
        Self {
            status: names(&["status"]),
            started: names(&["execution_start"]),
            executing: names(&["executing"]),
            progress: names(&["progress"]),
            finished: names(&["execution_success"]),
            errored: names(&["execution_error"]),
            cancelled: names(&["execution_interrupted"]),
        }
    }
}

impl EventVocabulary {
    /// Interpret a raw message.
    ///
    /// Returns `Err` when the type is known but its payload does not
    /// have the expected shape.
    pub fn classify(&self, msg: &RawMessage) -> Result<ProgressEvent, serde_json::Error> {
        let kind = msg.kind.as_str();
        let is = |names: &Vec<String>| names.iter().any(|n| n == kind);

        let event = if is(&self.status) {
            let data: StatusData = msg.decode()?;
            ProgressEvent::QueueStatus {
                queue_remaining: data.status.exec_info.queue_remaining,
            }
        } else if is(&self.started) {
            let data: PromptScopedData = msg.decode()?;
            ProgressEvent::ExecutionStarted {
                prompt_id: data.prompt_id,
            }
        } else if is(&self.executing) {
            let data: ExecutingData = msg.decode()?;
            match (data.prompt_id, data.node) {
                (Some(prompt_id), Some(node)) => ProgressEvent::NodeExecuting { prompt_id, node },
                (Some(prompt_id), None) => ProgressEvent::Finished { prompt_id },
                (None, _) => ProgressEvent::Other {
                    kind: msg.kind.clone(),
                    prompt_id: None,
                },
            }
        } else if is(&self.progress) {
            let data: ProgressData = msg.decode()?;
            ProgressEvent::NodeProgress {
                prompt_id: data.prompt_id,
                node: data.node,
                value: data.value,
                max: data.max,
            }
        } else if is(&self.finished) {
            let data: PromptScopedData = msg.decode()?;
            ProgressEvent::Finished {
                prompt_id: data.prompt_id,
            }
        } else if is(&self.errored) {
            let data: ErrorData = msg.decode()?;
            let message = if data.exception_type.is_empty() {
                data.exception_message
            } else {
                format!("{}: {}", data.exception_type, data.exception_message)
            };
            ProgressEvent::Errored {
                prompt_id: data.prompt_id,
                node_id: data.node_id,
                message,
            }
        } else if is(&self.cancelled) {
            let data: InterruptedData = msg.decode()?;
            ProgressEvent::Cancelled {
                prompt_id: data.prompt_id,
            }
        } else {
            ProgressEvent::Other {
                kind: msg.kind.clone(),
                prompt_id: msg.prompt_id().map(str::to_string),
            }
        };

        Ok(event)
    }
}
