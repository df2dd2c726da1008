//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for a single
//! ComfyUI instance and the run's client id.  Call
//! [`ComfyUIClient::connect`] to establish a live WebSocket stream.

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// The raw WebSocket stream of a ComfyUI connection.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Default ComfyUI address when none is configured.
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:8188";

/// HTTP and WebSocket base URLs derived from one server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoints {
    /// HTTP base URL, e.g. `http://host:8188`.
    pub api_url: String,
    /// WebSocket base URL, e.g. `ws://host:8188`.
    pub ws_url: String,
}

impl ServerEndpoints {
    /// Derive both base URLs from a server address.
    ///
    /// A bare `host:port` maps to `http://` and `ws://`. An explicit
    /// `https://` scheme maps to `wss://`.
    pub fn from_address(address: &str) -> Self {
        let address = address.trim().trim_end_matches('/');
        let (http_scheme, ws_scheme, host) = if let Some(rest) = address.strip_prefix("https://") {
            ("https", "wss", rest)
        } else if let Some(rest) = address.strip_prefix("http://") {
            ("http", "ws", rest)
        } else {
            ("http", "ws", address)
        };

        Self {
            api_url: format!("{http_scheme}://{host}"),
            ws_url: format!("{ws_scheme}://{host}"),
        }
    }
}

/// Generate a fresh client id for one orchestration run.
pub fn new_client_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Configuration handle for a ComfyUI WebSocket subscription.
///
/// The client id is fixed at construction so every (re)connection and
/// every submission of a run share the same push-notification scope.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    client_id: String,
}

impl ComfyUIClient {
    /// * `ws_url`    - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `client_id` - token scoping push notifications to this run.
    pub fn new(ws_url: String, client_id: String) -> Self {
        Self { ws_url, client_id }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// The client id is appended as the `clientId` query parameter so
    /// that ComfyUI addresses progress messages back to this client.
    pub async fn connect(&self) -> Result<WsStream, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, self.client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %self.client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ws_stream)
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address() {
        let e = ServerEndpoints::from_address("127.0.0.1:8188");
        assert_eq!(e.api_url, "http://127.0.0.1:8188");
        assert_eq!(e.ws_url, "ws://127.0.0.1:8188");
    }

    #[test]
    fn http_scheme_and_trailing_slash() {
        let e = ServerEndpoints::from_address("http://gpu-box:8188/");
        assert_eq!(e.api_url, "http://gpu-box:8188");
        assert_eq!(e.ws_url, "ws://gpu-box:8188");
    }

    #[test]
    fn https_maps_to_wss() {
        let e = ServerEndpoints::from_address("https://comfy.example.com");
        assert_eq!(e.api_url, "https://comfy.example.com");
        assert_eq!(e.ws_url, "wss://comfy.example.com");
    }

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(new_client_id(), new_client_id());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let client = ComfyUIClient::new(format!("ws://{addr}"), new_client_id());
        let result = client.connect().await;
        assert!(matches!(result, Err(ComfyUIClientError::Connection(_))));
    }
}
