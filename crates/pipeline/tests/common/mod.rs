//! In-process stand-in for a ComfyUI server.
//!
//! Serves `POST /prompt`, `GET /history/{id}`, `GET /view` and `/ws`
//! closely enough for the batch runner. Progress frames for a job are
//! queued when it is submitted and delivered over the submitting
//! client's WebSocket.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use comfybatch_comfyui::backoff::BackoffConfig;
use comfybatch_comfyui::client::ServerEndpoints;
use comfybatch_core::prompts::PromptPair;
use comfybatch_core::workflow::{JobTemplate, PatcherConfig};
use comfybatch_pipeline::RunConfig;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Behaviour knobs
// ---------------------------------------------------------------------------

/// How the mock server treats submitted jobs.
///
/// Jobs are matched by the positive prompt text found in the graph.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Ids handed out to the first submissions; later ones get `job-N`.
    pub job_ids: Vec<String>,
    /// Reject submissions containing this text with HTTP 400.
    pub reject_text: Option<String>,
    /// Jobs containing this text end with `execution_error`.
    pub error_text: Option<String>,
    /// Jobs containing this text start but never finish.
    pub stall_text: Option<String>,
    /// `(node_id, filename)` images listed in every job's history.
    pub images: Vec<(String, String)>,
    /// Filenames `/view` answers with 404.
    pub missing_files: Vec<String>,
    /// History lookups per job that return `{}` before the real entry.
    pub history_misses: usize,
}

impl MockBehavior {
    /// One SaveImage node "9" producing `img.png`.
    pub fn single_image() -> Self {
        Self {
            images: vec![("9".into(), "img.png".into())],
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

type FrameSender = mpsc::UnboundedSender<String>;
type FrameReceiver = mpsc::UnboundedReceiver<String>;

#[derive(Default)]
struct Inner {
    /// Per client id. Created by whichever of `/ws` or `/prompt` comes first.
    channels: HashMap<String, (FrameSender, Option<FrameReceiver>)>,
    jobs: Vec<String>,
    history_polls: HashMap<String, usize>,
    submitted: Vec<Value>,
}

impl Inner {
    fn sender(&mut self, client_id: &str) -> FrameSender {
        self.channels
            .entry(client_id.to_string())
            .or_insert_with(frame_channel)
            .0
            .clone()
    }

    fn take_receiver(&mut self, client_id: &str) -> FrameReceiver {
        let entry = self
            .channels
            .entry(client_id.to_string())
            .or_insert_with(frame_channel);
        match entry.1.take() {
            Some(rx) => rx,
            None => {
                // Reconnect: start a fresh channel.
                let (tx, rx) = mpsc::unbounded_channel();
                entry.0 = tx;
                rx
            }
        }
    }
}

fn frame_channel() -> (FrameSender, Option<FrameReceiver>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Some(rx))
}

#[derive(Clone)]
struct MockState {
    behavior: Arc<MockBehavior>,
    inner: Arc<Mutex<Inner>>,
}

/// A running mock server.
pub struct MockComfy {
    pub address: String,
    state: MockState,
}

impl MockComfy {
    pub async fn start(behavior: MockBehavior) -> Self {
        let state = MockState {
            behavior: Arc::new(behavior),
            inner: Arc::new(Mutex::new(Inner::default())),
        };

        let app = Router::new()
            .route("/prompt", post(submit))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/ws", get(ws_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { address, state }
    }

    /// Graphs received by `POST /prompt`, in order, excluding rejected ones.
    pub fn submitted(&self) -> Vec<Value> {
        self.state.inner.lock().unwrap().submitted.clone()
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.state.inner.lock().unwrap().jobs.clone()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PromptRequest {
    prompt: Value,
    client_id: String,
}

async fn submit(State(state): State<MockState>, Json(req): Json<PromptRequest>) -> Response {
    let behavior = &state.behavior;
    let matches = |text: &Option<String>| text.as_deref().is_some_and(|t| graph_has_text(&req.prompt, t));

    if matches(&behavior.reject_text) {
        let body = json!({
            "error": {
                "type": "prompt_outputs_failed_validation",
                "message": "Prompt outputs failed validation",
            },
            "node_errors": {},
        });
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }

    let mut inner = state.inner.lock().unwrap();
    let number = inner.jobs.len();
    let job_id = behavior
        .job_ids
        .get(number)
        .cloned()
        .unwrap_or_else(|| format!("job-{number}"));
    inner.jobs.push(job_id.clone());
    inner.submitted.push(req.prompt.clone());

    let tx = inner.sender(&req.client_id);
    let frames = if matches(&behavior.error_text) {
        errored_frames(&job_id)
    } else if matches(&behavior.stall_text) {
        stalled_frames(&job_id)
    } else {
        completed_frames(&job_id)
    };
    for frame in frames {
        let _ = tx.send(frame.to_string());
    }

    Json(json!({ "prompt_id": job_id, "number": number, "node_errors": {} })).into_response()
}

async fn history(State(state): State<MockState>, UrlPath(prompt_id): UrlPath<String>) -> Json<Value> {
    let mut inner = state.inner.lock().unwrap();
    if !inner.jobs.contains(&prompt_id) {
        return Json(json!({}));
    }
    let polls = inner.history_polls.entry(prompt_id.clone()).or_insert(0);
    *polls += 1;
    if *polls <= state.behavior.history_misses {
        return Json(json!({}));
    }

    let mut outputs = Map::new();
    for (node_id, filename) in &state.behavior.images {
        let node = outputs
            .entry(node_id.clone())
            .or_insert_with(|| json!({ "images": [] }));
        if let Some(images) = node["images"].as_array_mut() {
            images.push(json!({ "filename": filename, "subfolder": prompt_id, "type": "output" }));
        }
    }

    let mut doc = Map::new();
    doc.insert(
        prompt_id,
        json!({
            "prompt": [],
            "outputs": outputs,
            "status": { "status_str": "success", "completed": true, "messages": [] },
        }),
    );
    Json(Value::Object(doc))
}

#[derive(Deserialize)]
struct ViewParams {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default)]
    folder_type: String,
}

async fn view(State(state): State<MockState>, Query(params): Query<ViewParams>) -> Response {
    if state.behavior.missing_files.contains(&params.filename) || params.folder_type != "output" {
        return (StatusCode::NOT_FOUND, "file not found").into_response();
    }
    image_bytes(&params.subfolder, &params.filename).into_response()
}

#[derive(Deserialize)]
struct WsParams {
    #[serde(rename = "clientId")]
    client_id: String,
}

async fn ws_handler(
    State(state): State<MockState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = state.inner.lock().unwrap().take_receiver(&params.client_id);
    ws.on_upgrade(move |socket| pump(socket, rx))
}

async fn pump(socket: WebSocket, mut rx: FrameReceiver) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

fn status_frame(queue_remaining: u32) -> Value {
    json!({ "type": "status", "data": { "status": { "exec_info": { "queue_remaining": queue_remaining } } } })
}

fn completed_frames(job_id: &str) -> Vec<Value> {
    vec![
        status_frame(1),
        json!({ "type": "execution_start", "data": { "prompt_id": job_id } }),
        json!({ "type": "execution_cached", "data": { "nodes": ["4"], "prompt_id": job_id } }),
        json!({ "type": "executing", "data": { "node": "3", "prompt_id": job_id } }),
        json!({ "type": "progress", "data": { "value": 20, "max": 20, "prompt_id": job_id, "node": "3" } }),
        json!({ "type": "executing", "data": { "node": "9", "prompt_id": job_id } }),
        json!({ "type": "executing", "data": { "node": null, "prompt_id": job_id } }),
        status_frame(0),
    ]
}

fn errored_frames(job_id: &str) -> Vec<Value> {
    vec![
        status_frame(1),
        json!({ "type": "execution_start", "data": { "prompt_id": job_id } }),
        json!({ "type": "executing", "data": { "node": "3", "prompt_id": job_id } }),
        json!({
            "type": "execution_error",
            "data": {
                "prompt_id": job_id,
                "node_id": "3",
                "node_type": "KSampler",
                "exception_message": "CUDA out of memory",
                "exception_type": "torch.OutOfMemoryError",
                "traceback": [],
            },
        }),
    ]
}

fn stalled_frames(job_id: &str) -> Vec<Value> {
    vec![
        status_frame(1),
        json!({ "type": "execution_start", "data": { "prompt_id": job_id } }),
    ]
}

fn graph_has_text(graph: &Value, text: &str) -> bool {
    graph.as_object().is_some_and(|nodes| {
        nodes
            .values()
            .any(|node| node["inputs"]["text"].as_str() == Some(text))
    })
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Content served by `/view` for a file.
pub fn image_bytes(subfolder: &str, filename: &str) -> Vec<u8> {
    format!("PNG:{subfolder}/{filename}").into_bytes()
}

/// Text-to-image template with positive encoder "6" and negative "7".
pub fn template() -> JobTemplate {
    let graph = json!({
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "seed": 42, "steps": 20, "cfg": 7.0,
                "model": ["4", 0], "positive": ["6", 0], "negative": ["7", 0],
                "latent_image": ["5", 0]
            }
        },
        "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "sd15.safetensors" } },
        "5": { "class_type": "EmptyLatentImage", "inputs": { "width": 512, "height": 512, "batch_size": 1 } },
        "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "placeholder", "clip": ["4", 1] } },
        "7": { "class_type": "CLIPTextEncode", "inputs": { "text": "placeholder", "clip": ["4", 1] } },
        "8": { "class_type": "VAEDecode", "inputs": { "samples": ["3", 0], "vae": ["4", 2] } },
        "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "ComfyUI", "images": ["8", 0] } }
    });
    JobTemplate::from_json(graph, &PatcherConfig::default()).unwrap()
}

pub fn pair(id: i64, positive: &str, negative: &str) -> PromptPair {
    PromptPair {
        id,
        positive: positive.to_string(),
        negative: negative.to_string(),
    }
}

/// Run configuration with short timeouts and fast retries.
pub fn test_config(address: &str, output_dir: &Path) -> RunConfig {
    let fast = BackoffConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        max_attempts: 3,
    };
    RunConfig {
        server: ServerEndpoints::from_address(address),
        output_dir: output_dir.to_path_buf(),
        job_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        history_backoff: fast.clone(),
        reconnect_backoff: fast,
        ..RunConfig::default()
    }
}
