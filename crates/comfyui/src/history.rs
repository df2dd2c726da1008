//! Artifact references from ComfyUI job history.
//!
//! `GET /history/{prompt_id}` answers with
//! `{"<prompt_id>": {"outputs": {"<node_id>": {"images": [...]}}, ...}}`.
//! Each image entry names a file the server serves from `/view`.

use serde::Serialize;
use serde_json::Value;

use crate::fetcher::FetchError;

/// Output key under which nodes report produced images.
pub const IMAGE_OUTPUT_KEY: &str = "images";

/// Folder type used when an entry omits `type`.
const DEFAULT_FOLDER_TYPE: &str = "output";

/// Server-side pointer to one produced file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
    /// ComfyUI folder type (`output`, `temp`, ...), sent as `type`.
    #[serde(rename = "type")]
    pub folder_type: String,
    /// Position within the node's image list.
    pub index: usize,
}

/// Extract every image reference produced by `job_id`.
///
/// Nodes are visited in ascending id order; images keep their order
/// within a node. Entries without a filename are skipped. A document
/// without an entry for `job_id` is [`FetchError::HistoryNotFound`].
pub fn extract_artifacts(history: &Value, job_id: &str) -> Result<Vec<ArtifactRef>, FetchError> {
    let entry = history
        .get(job_id)
        .filter(|entry| entry.is_object())
        .ok_or_else(|| FetchError::HistoryNotFound {
            job_id: job_id.to_string(),
        })?;

    let Some(outputs) = entry.get("outputs").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };

    let mut node_ids: Vec<&String> = outputs.keys().collect();
    node_ids.sort();

    let mut artifacts = Vec::new();
    for node_id in node_ids {
        let Some(images) = outputs[node_id.as_str()]
            .get(IMAGE_OUTPUT_KEY)
            .and_then(Value::as_array)
        else {
            continue;
        };

        for (index, image) in images.iter().enumerate() {
            let Some(filename) = image.get("filename").and_then(Value::as_str) else {
                tracing::warn!(
                    job_id,
                    node_id = %node_id,
                    index,
                    "History image entry has no filename, skipping",
                );
                continue;
            };
            let text_field = |key: &str, default: &str| {
                image
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or(default)
                    .to_string()
            };

            artifacts.push(ArtifactRef {
                node_id: node_id.clone(),
                filename: filename.to_string(),
                subfolder: text_field("subfolder", ""),
                folder_type: text_field("type", DEFAULT_FOLDER_TYPE),
                index,
            });
        }
    }

    Ok(artifacts)
}
