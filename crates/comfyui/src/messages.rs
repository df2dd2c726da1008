//! ComfyUI WebSocket message envelope and payload types.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. The envelope is parsed first;
//! payloads are decoded into the typed structs below once
//! [`EventVocabulary`](crate::events::EventVocabulary) has decided what
//! the `type` string means.

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// A parsed but not yet interpreted WebSocket text message.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    /// Event type string as sent by the server.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RawMessage {
    /// Job identifier embedded in the payload, if any.
    pub fn prompt_id(&self) -> Option<&str> {
        self.data.get("prompt_id").and_then(serde_json::Value::as_str)
    }

    /// Decode the payload into one of the typed `*Data` structs.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `execution_start` and similar prompt-scoped messages.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptScopedData {
    pub prompt_id: String,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress within a node).
///
/// Older ComfyUI releases omit `prompt_id` and `node`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: i32,
    /// Total number of steps.
    pub max: i32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// Payload for `execution_interrupted` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Parse a ComfyUI WebSocket text message into its envelope.
///
/// Returns `Err` for malformed JSON or a missing `type` field.
/// Callers should log and continue.
pub fn parse_message(text: &str) -> Result<RawMessage, serde_json::Error> {
    serde_json::from_str(text)
}
