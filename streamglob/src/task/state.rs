//! Task lifecycle state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle of a play or download task.
///
/// ```text
/// Created -> ProgramBound -> ProcessRunning -> Finalizing -> Done | Failed | Cancelled
///                 ^                 |
///                 +-- next stage ---+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Sources and options captured, nothing resolved yet.
    #[default]
    Created,
    /// A player or downloader has been resolved for the current stage.
    ProgramBound,
    /// A process is running for the current stage.
    ProcessRunning,
    /// The terminal process exited or was cancelled; bookkeeping in progress.
    Finalizing,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::ProgramBound => "PROGRAM_BOUND",
            Self::ProcessRunning => "PROCESS_RUNNING",
            Self::Finalizing => "FINALIZING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Whether the task's result slot may already be set.
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalizing) || self.is_terminal()
    }

    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        match (self, target) {
            (Done | Failed | Cancelled, _) => false,

            // Failure is absorbing from anywhere live.
            (_, Failed) => true,

            (Created, ProgramBound | Cancelled) => true,
            (ProgramBound, ProcessRunning | Finalizing | Created | Cancelled) => true,
            // Back to ProgramBound between download stages.
            (ProcessRunning, ProgramBound | Finalizing | Created) => true,
            (Created, Finalizing) => true,
            (Finalizing, Done | Cancelled) => true,

            _ => false,
        }
    }

    pub fn transition_to(&self, target: TaskState) -> Result<TaskState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
