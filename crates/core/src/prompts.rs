//! Prompt file parsing.
//!
//! The prompt file is a JSON document of the form
//! `{"prompts": [{"id": 1, "positive": "...", "negative": "..."}]}`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::PromptId;

/// A positive/negative prompt pair for one batch item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPair {
    pub id: PromptId,
    pub positive: String,
    #[serde(default)]
    pub negative: String,
}

/// Parsed contents of a prompt file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptFile {
    pub prompts: Vec<PromptPair>,
}

impl PromptFile {
    /// Parse a prompt file from a JSON string. Call [`validate`](Self::validate)
    /// before using the result.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Read, parse, and validate the prompt file at `path`.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Self::from_json_str(&text).map_err(|source| CoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        file.validate()?;
        Ok(file)
    }

    /// Ensure prompt ids are unique, since they name the output files.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::with_capacity(self.prompts.len());
        for prompt in &self.prompts {
            if !seen.insert(prompt.id) {
                return Err(CoreError::Validation(format!(
                    "Duplicate prompt id {} in prompt file",
                    prompt.id
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

/// Shorten `text` to at most `max_chars` characters for log output,
/// appending `...` when anything was cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
