//! Caller-side view of a submitted task.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::recorder::Bookkeeping;
use crate::task::{Task, TaskId, TaskMode, TaskOutcome, TaskState};

/// Terminal result of a task as seen by its submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub mode: TaskMode,
    pub title: String,
    pub outcome: TaskOutcome,
    pub bookkeeping: Bookkeeping,
    /// Final destination of a download.
    pub destination: Option<PathBuf>,
    pub stage_outputs: Vec<PathBuf>,
}

impl TaskReport {
    pub(crate) fn from_task(task: &Task, bookkeeping: Bookkeeping) -> Self {
        let payload = task.download_payload();
        Self {
            id: task.id(),
            mode: task.mode(),
            title: task.title().to_string(),
            outcome: task
                .result()
                .cloned()
                .unwrap_or_else(|| TaskOutcome::failed(None, "task finished without a result")),
            bookkeeping,
            destination: payload.map(|p| p.final_destination()),
            stage_outputs: payload
                .map(|p| p.stage_outputs().to_vec())
                .unwrap_or_default(),
        }
    }

    /// Report for a driver that went away without publishing one.
    fn aborted(shared: &TaskShared) -> Self {
        Self {
            id: shared.id,
            mode: shared.mode,
            title: shared.title.clone(),
            outcome: TaskOutcome::failed(None, "task driver aborted"),
            bookkeeping: Bookkeeping::Lost("task driver aborted".to_string()),
            destination: None,
            stage_outputs: Vec::new(),
        }
    }

    /// The task succeeded and its bookkeeping is durable.
    pub fn is_success(&self) -> bool {
        self.outcome.is_success() && !self.bookkeeping.is_lost()
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

/// State shared between the manager, the task's driver and its handles.
#[derive(Debug)]
pub(crate) struct TaskShared {
    pub(crate) id: TaskId,
    pub(crate) mode: TaskMode,
    pub(crate) title: String,
    pub(crate) cancel: CancellationToken,
    state_tx: watch::Sender<TaskState>,
    report_tx: watch::Sender<Option<TaskReport>>,
}

impl TaskShared {
    pub(crate) fn new(task: &Task, cancel: CancellationToken) -> Arc<Self> {
        let (state_tx, _) = watch::channel(task.state());
        let (report_tx, _) = watch::channel(None);
        Arc::new(Self {
            id: task.id(),
            mode: task.mode(),
            title: task.title().to_string(),
            cancel,
            state_tx,
            report_tx,
        })
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state_tx.borrow()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) fn report(&self) -> Option<TaskReport> {
        self.report_tx.borrow().clone()
    }

    /// Publish the terminal report. Only the first report sticks.
    pub(crate) fn complete(&self, report: TaskReport) {
        self.report_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(report);
            true
        });
    }

    pub(crate) fn complete_aborted(&self) {
        self.complete(TaskReport::aborted(self));
    }

    pub(crate) async fn finished(&self) -> TaskReport {
        let mut rx = self.report_tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(report) = current {
                return report;
            }
            // The sender lives as long as `self`.
            if rx.changed().await.is_err() {
                return TaskReport::aborted(self);
            }
        }
    }
}

/// Handle to a submitted task.
///
/// Dropping the handle does not cancel the task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub(crate) fn new(shared: Arc<TaskShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn mode(&self) -> TaskMode {
        self.shared.mode
    }

    pub fn title(&self) -> &str {
        &self.shared.title
    }

    /// Current state of the task.
    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    /// The report, if the task has finished.
    pub fn try_report(&self) -> Option<TaskReport> {
        self.shared.report()
    }

    /// Wait for the task to finish.
    pub async fn wait(&self) -> TaskReport {
        self.shared.finished().await
    }
}
