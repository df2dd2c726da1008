//! ComfyUI job templates and prompt injection.
//!
//! A template is a ComfyUI API-format workflow: an object keyed by node
//! id whose values carry a `class_type` and an `inputs` map. On load,
//! every text-encoder node is resolved to a [`NodeKind`] once, so that
//! [`JobTemplate::patch`] only has to write strings into a copy of the
//! graph.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use serde_json::{Map, Value};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// ComfyUI conventions
// ---------------------------------------------------------------------------

/// CLIP text encode node class type.
pub const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";

/// Input field holding the prompt text on encoder nodes.
pub const DEFAULT_TEXT_FIELD: &str = "text";

/// Sampler input carrying positive conditioning.
const POSITIVE_INPUT: &str = "positive";

/// Sampler input carrying negative conditioning.
const NEGATIVE_INPUT: &str = "negative";

/// Words that mark an otherwise unresolved encoder as the negative prompt.
const NEGATIVE_KEYWORDS: &[&str] = &["nsfw", "worst", "low quality", "bad"];

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Which side of the conditioning a prompt encoder feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub const ALL: [Polarity; 2] = [Polarity::Positive, Polarity::Negative];

    /// Name of the sampler input that carries this polarity.
    fn input_name(self) -> &'static str {
        match self {
            Polarity::Positive => POSITIVE_INPUT,
            Polarity::Negative => NEGATIVE_INPUT,
        }
    }
}

impl std::fmt::Display for Polarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.input_name())
    }
}

/// Role of a node as far as prompt injection is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    PromptEncoder(Polarity),
    Other,
}

/// How encoder nodes are recognised and how strictly roles are enforced.
#[derive(Debug, Clone)]
pub struct PatcherConfig {
    /// Class types treated as prompt encoders.
    pub encoder_classes: Vec<String>,
    /// Input field overwritten with the prompt text.
    pub text_field: String,
    /// Reject templates that lack a positive or a negative encoder.
    pub strict: bool,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            encoder_classes: vec![CLIP_TEXT_ENCODE_CLASS.to_string()],
            text_field: DEFAULT_TEXT_FIELD.to_string(),
            strict: false,
        }
    }
}

/// A single node of a loaded template.
#[derive(Debug, Clone)]
pub struct TemplateNode {
    pub id: String,
    pub class_type: String,
    pub kind: NodeKind,
}

/// How an encoder's polarity was decided, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Link,
    Title,
    Keyword,
}

/// A parsed, role-resolved job template. Immutable after load.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    graph: Map<String, Value>,
    /// All nodes, sorted by id.
    nodes: Vec<TemplateNode>,
    roles: BTreeMap<Polarity, Vec<String>>,
    text_field: String,
}

/// A template copy with the prompt text written into its encoder nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchedGraph {
    graph: Value,
}

impl PatchedGraph {
    pub fn as_json(&self) -> &Value {
        &self.graph
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl JobTemplate {
    /// Read and parse a template file.
    pub fn load(path: &Path, config: &PatcherConfig) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let json: Value = serde_json::from_str(&text).map_err(|source| CoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(json, config)
    }

    /// Parse a template and resolve its prompt-encoder roles.
    ///
    /// The expected format is an object where each key is a node ID and
    /// each value is an object with `class_type` and `inputs` fields:
    ///
    /// ```json
    /// {
    ///   "6": {
    ///     "class_type": "CLIPTextEncode",
    ///     "inputs": { "text": "a photo", "clip": ["4", 1] }
    ///   }
    /// }
    /// ```
    pub fn from_json(json: Value, config: &PatcherConfig) -> Result<Self, CoreError> {
        let Value::Object(graph) = json else {
            return Err(CoreError::Validation(
                "Workflow JSON must be an object".to_string(),
            ));
        };

        if graph.is_empty() {
            return Err(CoreError::Validation(
                "Workflow JSON must contain at least one node".to_string(),
            ));
        }

        let mut class_types = BTreeMap::new();
        for (node_id, node_value) in &graph {
            let class_type = node_value
                .get("class_type")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    CoreError::Validation(format!(
                        "Node '{node_id}' is missing required 'class_type' field"
                    ))
                })?;
            class_types.insert(node_id.as_str(), class_type);
        }

        let is_encoder = |id: &str| {
            class_types
                .get(id)
                .is_some_and(|c| config.encoder_classes.iter().any(|e| e.as_str() == *c))
        };

        // Encoders whose text is a literal string; linked text cannot be patched.
        let candidates: BTreeSet<&str> = class_types
            .keys()
            .copied()
            .filter(|id| is_encoder(*id))
            .filter(|id| literal_text(&graph, id, &config.text_field).is_some())
            .collect();

        let reached = trace_polarities(&graph, &is_encoder);

        let mut roles: BTreeMap<Polarity, Vec<String>> = BTreeMap::new();
        let mut nodes = Vec::with_capacity(graph.len());

        for (node_id, class_type) in &class_types {
            let kind = if candidates.contains(node_id) {
                let (polarity, how) =
                    resolve_polarity(&graph, node_id, &config.text_field, reached.get(*node_id));
                tracing::debug!(
                    node_id = %node_id,
                    polarity = %polarity,
                    resolution = ?how,
                    "Resolved prompt encoder",
                );
                roles.entry(polarity).or_default().push(node_id.to_string());
                NodeKind::PromptEncoder(polarity)
            } else {
                NodeKind::Other
            };

            nodes.push(TemplateNode {
                id: node_id.to_string(),
                class_type: class_type.to_string(),
                kind,
            });
        }

        for polarity in Polarity::ALL {
            if roles.get(&polarity).is_some_and(|ids| !ids.is_empty()) {
                continue;
            }
            if config.strict {
                return Err(CoreError::Validation(format!(
                    "Workflow has no {polarity} prompt encoder node"
                )));
            }
            tracing::warn!(
                polarity = %polarity,
                "No {polarity} prompt encoder found; the template value will be submitted unchanged",
            );
        }

        Ok(Self {
            graph,
            nodes,
            roles,
            text_field: config.text_field.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn nodes(&self) -> &[TemplateNode] {
        &self.nodes
    }

    pub fn node_kind(&self, node_id: &str) -> Option<NodeKind> {
        self.nodes
            .binary_search_by(|n| n.id.as_str().cmp(node_id))
            .ok()
            .map(|idx| self.nodes[idx].kind)
    }

    /// Ids of the encoder nodes resolved to `polarity`, in id order.
    pub fn node_ids(&self, polarity: Polarity) -> &[String] {
        self.roles.get(&polarity).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The unmodified template graph.
    pub fn graph(&self) -> &Map<String, Value> {
        &self.graph
    }

    // -----------------------------------------------------------------------
    // Patching
    // -----------------------------------------------------------------------

    /// Produce a deep copy of the template with the prompt pair written
    /// into every resolved encoder node.
    ///
    /// The template itself is never modified. A polarity without any
    /// encoder node is left as it is in the template.
    pub fn patch(&self, positive: &str, negative: &str) -> PatchedGraph {
        let mut graph = self.graph.clone();

        for (polarity, text) in [(Polarity::Positive, positive), (Polarity::Negative, negative)] {
            for node_id in self.node_ids(polarity) {
                let inputs = graph
                    .get_mut(node_id)
                    .and_then(|node| node.get_mut("inputs"))
                    .and_then(Value::as_object_mut);
                if let Some(inputs) = inputs {
                    inputs.insert(self.text_field.clone(), Value::String(text.to_string()));
                }
            }
        }

        PatchedGraph {
            graph: Value::Object(graph),
        }
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn inputs_of<'a>(graph: &'a Map<String, Value>, node_id: &str) -> Option<&'a Map<String, Value>> {
    graph
        .get(node_id)
        .and_then(|node| node.get("inputs"))
        .and_then(Value::as_object)
}

fn literal_text<'a>(graph: &'a Map<String, Value>, node_id: &str, field: &str) -> Option<&'a str> {
    inputs_of(graph, node_id)
        .and_then(|inputs| inputs.get(field))
        .and_then(Value::as_str)
}

/// Source node of a link value.
///
/// ComfyUI encodes connections as arrays: `[source_node_id, output_index]`.
fn link_source(value: &Value) -> Option<String> {
    let arr = value.as_array()?;
    if arr.len() != 2 || !(arr[1].is_u64() || arr[1].is_string()) {
        return None;
    }
    if let Some(s) = arr[0].as_str() {
        Some(s.to_string())
    } else {
        arr[0].as_u64().map(|n| n.to_string())
    }
}

/// Walk upstream from every `positive`/`negative` link input and record
/// which polarities reach each encoder node.
fn trace_polarities(
    graph: &Map<String, Value>,
    is_encoder: &impl Fn(&str) -> bool,
) -> BTreeMap<String, BTreeSet<Polarity>> {
    let mut reached: BTreeMap<String, BTreeSet<Polarity>> = BTreeMap::new();

    for node_id in graph.keys() {
        if is_encoder(node_id.as_str()) {
            continue;
        }
        let Some(inputs) = inputs_of(graph, node_id) else {
            continue;
        };
        for polarity in Polarity::ALL {
            let Some(start) = inputs.get(polarity.input_name()).and_then(link_source) else {
                continue;
            };

            let mut visited = HashSet::new();
            let mut stack = vec![start];
            while let Some(current) = stack.pop() {
                if !visited.insert(current.clone()) {
                    continue;
                }
                if is_encoder(current.as_str()) {
                    reached.entry(current).or_default().insert(polarity);
                    continue;
                }
                let Some(upstream) = inputs_of(graph, &current) else {
                    continue;
                };
                let splits_polarity = Polarity::ALL
                    .iter()
                    .any(|p| upstream.get(p.input_name()).and_then(link_source).is_some());
                if splits_polarity {
                    stack.extend(upstream.get(polarity.input_name()).and_then(link_source));
                } else {
                    stack.extend(upstream.values().filter_map(link_source));
                }
            }
        }
    }

    reached
}

fn resolve_polarity(
    graph: &Map<String, Value>,
    node_id: &str,
    text_field: &str,
    reached: Option<&BTreeSet<Polarity>>,
) -> (Polarity, Resolution) {
    if let Some(set) = reached {
        if set.len() == 1 {
            if let Some(&polarity) = set.iter().next() {
                return (polarity, Resolution::Link);
            }
        }
    }

    let title = graph
        .get(node_id)
        .and_then(|node| node.get("_meta"))
        .and_then(|meta| meta.get("title"))
        .and_then(Value::as_str)
        .map(str::to_lowercase);
    if let Some(title) = title {
        if title.contains(NEGATIVE_INPUT) {
            return (Polarity::Negative, Resolution::Title);
        }
        if title.contains(POSITIVE_INPUT) {
            return (Polarity::Positive, Resolution::Title);
        }
    }

    let text = literal_text(graph, node_id, text_field)
        .unwrap_or_default()
        .to_lowercase();
    if NEGATIVE_KEYWORDS.iter().any(|word| text.contains(word)) {
        (Polarity::Negative, Resolution::Keyword)
    } else {
        (Polarity::Positive, Resolution::Keyword)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
