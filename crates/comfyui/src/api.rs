//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, history retrieval,
//! artifact download) using [`reqwest`].

use std::time::Duration;

use comfybatch_core::workflow::PatchedGraph;
use serde::Deserialize;

use crate::history::ArtifactRef;

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation problems the server tolerated.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// A submitted job, scoped to the client id whose push channel reports
/// its progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    pub client_id: String,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body, as sent by the server.
        body: String,
    },
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Create an API client whose requests give up after `timeout`.
    pub fn with_timeout(api_url: String, timeout: Duration) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    /// HTTP API base URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID.  Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Submit a patched graph and return the handle used to track it.
    ///
    /// One request, no retries. A rejection carries the server's
    /// response body unchanged.
    pub async fn submit(
        &self,
        graph: &PatchedGraph,
        client_id: &str,
    ) -> Result<JobHandle, ComfyUIApiError> {
        let response = self.submit_workflow(graph.as_json(), client_id).await?;

        if response.node_errors.as_object().is_some_and(|m| !m.is_empty()) {
            tracing::warn!(
                prompt_id = %response.prompt_id,
                node_errors = %response.node_errors,
                "ComfyUI accepted the workflow with node errors",
            );
        }

        tracing::debug!(
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Workflow queued",
        );

        Ok(JobHandle {
            job_id: response.prompt_id,
            client_id: client_id.to_string(),
        })
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request.  The returned JSON
    /// is keyed by prompt id and contains output file references and
    /// status data. An unknown prompt yields an empty object.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download one produced file via `GET /view`.
    pub async fn view(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.folder_type.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_response_minimal() {
        let resp: SubmitResponse = serde_json::from_str(r#"{"prompt_id":"abc"}"#).unwrap();
        assert_eq!(resp.prompt_id, "abc");
        assert_eq!(resp.number, 0);
        assert!(resp.node_errors.is_null());
    }

    #[test]
    fn submit_response_full() {
        let resp: SubmitResponse =
            serde_json::from_str(r#"{"prompt_id":"abc","number":4,"node_errors":{}}"#).unwrap();
        assert_eq!(resp.number, 4);
        assert!(resp.node_errors.is_object());
    }

    #[test]
    fn api_error_keeps_server_body() {
        let err = ComfyUIApiError::ApiError {
            status: 400,
            body: r#"{"error":{"type":"prompt_outputs_failed_validation"}}"#.to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("400"));
        assert!(text.contains("prompt_outputs_failed_validation"));
    }

    #[tokio::test]
    async fn unreachable_server_is_request_error() {
        // Bind and release a port so nothing is listening on it.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let api = ComfyUIApi::with_timeout(format!("http://{addr}"), Duration::from_secs(2))
            .unwrap();
        let result = api.get_history("abc").await;
        assert!(matches!(result, Err(ComfyUIApiError::Request(_))));
    }
}
