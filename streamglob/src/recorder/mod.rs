//! Completion Recorder.
//!
//! Makes the side effects of a finished task durable: moves the last stage
//! output into place, removes the scratch directory and partial output,
//! and stamps the catalog.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::database::CatalogRepository;
use crate::task::{DownloadPayload, Task, TaskMode, TaskOutcome};
use crate::utils::fs::{move_file, remove_file_if_exists, same_file};
use crate::{Error, Result};

/// What happened to a task's completion bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum Bookkeeping {
    /// Stamps written.
    Recorded,
    /// Nothing to stamp (cancelled or failed download, play that never
    /// started, or sources not in the catalog).
    Skipped,
    /// Bookkeeping failed; the caller should retry.
    Lost(String),
}

impl Bookkeeping {
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost(_))
    }
}

/// Finalises tasks against the catalog.
pub struct CompletionRecorder {
    catalog: Option<Arc<dyn CatalogRepository>>,
}

impl CompletionRecorder {
    pub fn new(catalog: Arc<dyn CatalogRepository>) -> Self {
        Self {
            catalog: Some(catalog),
        }
    }

    /// Recorder that only does filesystem work.
    pub fn without_catalog() -> Self {
        Self { catalog: None }
    }

    /// Point the task's catalog sources at it. Failures are logged and
    /// otherwise ignored.
    pub async fn attach(&self, task: &Task) {
        let Some(catalog) = &self.catalog else {
            return;
        };
        let source_ids = task.source_ids();
        if source_ids.is_empty() {
            return;
        }
        if let Err(e) = catalog
            .attach_task(&source_ids, &task.id().to_string())
            .await
        {
            warn!(task_id = %task.id(), error = %e, "Failed to attach task to sources");
        }
    }

    /// Finalise `task` with `outcome`, run kind-specific bookkeeping and
    /// move the task to its terminal state.
    ///
    /// Only the first call does any work. Repeating the same outcome returns
    /// [`Bookkeeping::Skipped`]; a conflicting outcome is an error. Use
    /// [`record`](Self::record) to retry bookkeeping that was lost.
    pub async fn finalize(&self, task: &mut Task, outcome: TaskOutcome) -> Result<Bookkeeping> {
        let outcome = match task.download_payload() {
            Some(payload) if outcome.is_success() && payload.destination_in_scratch() => {
                TaskOutcome::failed(
                    None,
                    format!(
                        "destination {} is inside the scratch directory",
                        payload.destination().display()
                    ),
                )
            }
            _ => outcome,
        };
        if !task.finalize(outcome)? {
            debug!(task_id = %task.id(), "Task already finalized");
            return Ok(Bookkeeping::Skipped);
        }
        let bookkeeping = self.record(task).await;
        task.complete()?;
        Ok(bookkeeping)
    }

    /// Bookkeeping for a task whose result slot is set.
    pub async fn record(&self, task: &mut Task) -> Bookkeeping {
        let Some(outcome) = task.result().cloned() else {
            return Bookkeeping::Lost("task has no result".to_string());
        };

        let result = match task.mode() {
            TaskMode::Play => self.record_play(task).await,
            TaskMode::Download => self.record_download(task, &outcome).await,
        };

        match result {
            Ok(bookkeeping) => bookkeeping,
            Err(e) => {
                error!(
                    task_id = %task.id(),
                    title = task.title(),
                    error = %e,
                    "Completion bookkeeping lost"
                );
                Bookkeeping::Lost(e.to_string())
            }
        }
    }

    async fn record_play(&self, task: &Task) -> Result<Bookkeeping> {
        // Attempted playback counts as viewed, whatever the exit status.
        if !task.has_spawned() {
            return self.release(task).await;
        }
        self.stamp(task, StampKind::Viewed).await
    }

    async fn record_download(&self, task: &mut Task, outcome: &TaskOutcome) -> Result<Bookkeeping> {
        let task_id = task.id();
        let payload = task
            .download_payload_mut()
            .ok_or_else(|| Error::validation("not a download task"))?;

        if !outcome.is_success() {
            discard_partial_output(payload).await;
            cleanup_scratch(payload, task_id);
            info!(%task_id, %outcome, "Download not recorded");
            return self.release(task).await;
        }

        let placed = place_output(payload).await;
        cleanup_scratch(payload, task_id);
        let destination = placed?;
        info!(%task_id, destination = %destination.display(), "Download complete");

        self.stamp(task, StampKind::Downloaded).await
    }

    /// Drop the task's claim on its sources without stamping them.
    async fn release(&self, task: &Task) -> Result<Bookkeeping> {
        let Some(catalog) = &self.catalog else {
            return Ok(Bookkeeping::Skipped);
        };
        let source_ids = task.source_ids();
        if !source_ids.is_empty() {
            catalog
                .release_task(&source_ids, &task.id().to_string())
                .await?;
        }
        Ok(Bookkeeping::Skipped)
    }

    async fn stamp(&self, task: &Task, kind: StampKind) -> Result<Bookkeeping> {
        let Some(catalog) = &self.catalog else {
            return Ok(Bookkeeping::Skipped);
        };
        let source_ids = task.source_ids();
        if source_ids.is_empty() && task.listing_id().is_none() {
            debug!(task_id = %task.id(), "No catalog entries to stamp");
            return Ok(Bookkeeping::Skipped);
        }

        let now = Utc::now();
        match kind {
            StampKind::Viewed => {
                catalog
                    .mark_viewed(task.listing_id(), &source_ids, now)
                    .await?
            }
            StampKind::Downloaded => {
                catalog
                    .mark_downloaded(task.listing_id(), &source_ids, now)
                    .await?
            }
        }
        debug!(task_id = %task.id(), ?kind, sources = source_ids.len(), "Recorded completion");
        Ok(Bookkeeping::Recorded)
    }
}

#[derive(Debug, Clone, Copy)]
enum StampKind {
    Viewed,
    Downloaded,
}

/// Move the last stage output to the (normalised) destination unless it
/// is already there.
async fn place_output(payload: &DownloadPayload) -> Result<std::path::PathBuf> {
    let destination = payload.final_destination();
    let last = payload
        .last_output()
        .ok_or_else(|| Error::validation("download finished without stage output"))?;

    if same_file(last, &destination) {
        return Ok(destination);
    }
    // Placed by an earlier attempt.
    if !tokio::fs::try_exists(last).await.unwrap_or(false)
        && tokio::fs::try_exists(&destination).await.unwrap_or(false)
    {
        return Ok(destination);
    }
    move_file(last, &destination).await?;
    debug!(
        from = %last.display(),
        to = %destination.display(),
        "Moved final stage output"
    );
    Ok(destination)
}

/// Remove output this task started writing at the destination.
async fn discard_partial_output(payload: &DownloadPayload) {
    if !payload.wrote_destination() {
        return;
    }
    let destination = payload.destination();
    if let Some(scratch) = payload.scratch().existing_path()
        && destination.starts_with(scratch)
    {
        return;
    }
    match remove_file_if_exists(destination).await {
        Ok(true) => debug!(path = %destination.display(), "Removed partial output"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Failed to remove partial output"),
    }
}

fn cleanup_scratch(payload: &mut DownloadPayload, task_id: crate::task::TaskId) {
    if let Err(e) = payload.scratch_mut().cleanup() {
        warn!(%task_id, error = %e, "Failed to remove scratch directory");
    }
}
