//! Stage planning types.

use std::path::PathBuf;

/// Where a stage reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageInput {
    /// The task's source locators (the fetch stage).
    Sources,
    /// The previous stage's output file.
    File(PathBuf),
}

/// Input and output of one download stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub index: usize,
    pub input: StageInput,
    pub output: PathBuf,
}
