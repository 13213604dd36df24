//! Task lifecycle events.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::recorder::Bookkeeping;
use crate::task::{TaskId, TaskMode, TaskOutcome};

/// Broadcast by the manager as tasks move through the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A download waits for a free slot. `position` is 0-based.
    Queued {
        task_id: TaskId,
        title: String,
        position: usize,
    },
    /// A task got its slot and is being driven.
    Started {
        task_id: TaskId,
        mode: TaskMode,
        title: String,
    },
    /// A stage process was spawned.
    StageStarted {
        task_id: TaskId,
        stage: usize,
        program: String,
        output: PathBuf,
    },
    /// Terminal. Emitted once per task.
    Finished {
        task_id: TaskId,
        outcome: TaskOutcome,
        bookkeeping: Bookkeeping,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Queued { task_id, .. }
            | Self::Started { task_id, .. }
            | Self::StageStarted { task_id, .. }
            | Self::Finished { task_id, .. } => *task_id,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}
