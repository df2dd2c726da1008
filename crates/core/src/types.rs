/// Caller-assigned identifier of one prompt pair in a batch.
pub type PromptId = i64;

/// One downloaded artifact, ready to be written to the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub prompt_id: PromptId,
    /// Graph node that produced the artifact.
    pub node_id: String,
    /// Position of the artifact within its node's outputs.
    pub index: usize,
    pub bytes: Vec<u8>,
}

impl OutputFile {
    /// Deterministic file name, see [`crate::naming::output_filename`].
    pub fn filename(&self) -> String {
        crate::naming::output_filename(self.prompt_id, &self.node_id, self.index)
    }
}
