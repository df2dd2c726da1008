//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, the push-notification subscription
//! and job progress state machine, HTTP API wrappers for submission,
//! history, and artifact download, and retry backoff for talking to a
//! ComfyUI image-generation server.

pub mod api;
pub mod backoff;
pub mod client;
pub mod events;
pub mod fetcher;
pub mod history;
pub mod messages;
pub mod monitor;
