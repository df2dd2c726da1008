//! Output file naming convention.
//!
//! Generates deterministic filenames for downloaded artifacts based on
//! the prompt id, the producing node, and the artifact's index within
//! that node.

use crate::types::PromptId;

/// Extension used for every written artifact.
pub const OUTPUT_EXTENSION: &str = "png";

/// Generate an artifact filename.
///
/// Convention: `prompt_{prompt_id}_node_{node_id}_{index}.png`
///
/// Path separators inside `node_id` are replaced by `_` so the result
/// always names a file directly inside the output directory.
///
/// # Examples
///
/// ```
/// use comfybatch_core::naming::output_filename;
///
/// assert_eq!(output_filename(1, "9", 0), "prompt_1_node_9_0.png");
/// assert_eq!(output_filename(12, "save", 3), "prompt_12_node_save_3.png");
/// ```
pub fn output_filename(prompt_id: PromptId, node_id: &str, index: usize) -> String {
    format!(
        "prompt_{prompt_id}_node_{}_{index}.{OUTPUT_EXTENSION}",
        sanitize_segment(node_id)
    )
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}
