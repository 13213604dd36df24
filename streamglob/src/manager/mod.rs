//! Task Manager.
//!
//! Downloads share a bounded pool: up to `max_concurrent_tasks` run at
//! once and the rest wait in a FIFO queue. Plays use a separate single
//! preview slot where a new play supersedes the previous one.

mod events;
mod handle;
mod pool;

pub use events::TaskEvent;
pub use handle::{TaskHandle, TaskReport};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use self::handle::TaskShared;
use self::pool::{Admissions, PoolState, Queued};
use crate::config::{DEFAULT_MAX_CONCURRENT_TASKS, TasksConfig};
use crate::pipeline::{self, StageContext, StageObserver, StagePlan};
use crate::program::ProgramResolver;
use crate::recorder::{Bookkeeping, CompletionRecorder};
use crate::task::{Task, TaskId, TaskMode, TaskState};
use crate::{Error, Result};

/// Trait for components that can adjust the download concurrency limit.
pub trait DownloadLimitAdjuster: Send + Sync {
    /// Set the maximum concurrent downloads limit.
    fn set_max_concurrent_downloads(&self, limit: usize);

    /// Get the current maximum concurrent downloads limit.
    fn get_max_concurrent_downloads(&self) -> usize;
}

/// Configuration for the Task Manager.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Maximum concurrent downloads.
    pub max_concurrent_tasks: usize,
    /// Pause between download stages.
    pub stage_delay: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            stage_delay: Duration::ZERO,
        }
    }
}

impl From<&TasksConfig> for TaskManagerConfig {
    fn from(config: &TasksConfig) -> Self {
        Self {
            max_concurrent_tasks: config.max_concurrent_tasks,
            stage_delay: config.stage_delay(),
        }
    }
}

struct Inner {
    stage_delay: Duration,
    resolver: Arc<dyn ProgramResolver>,
    recorder: Arc<CompletionRecorder>,
    pool: Mutex<PoolState>,
    preview: Mutex<Option<Arc<TaskShared>>>,
    event_tx: broadcast::Sender<TaskEvent>,
    /// Parent of every task's cancellation token.
    shutdown: CancellationToken,
    drivers: TaskTracker,
}

/// Admits, runs and finalises tasks.
///
/// Cheap to clone. `play` and `download` spawn onto the current tokio
/// runtime.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(
        config: TaskManagerConfig,
        resolver: Arc<dyn ProgramResolver>,
        recorder: Arc<CompletionRecorder>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                stage_delay: config.stage_delay,
                resolver,
                recorder,
                pool: Mutex::new(PoolState::new(config.max_concurrent_tasks)),
                preview: Mutex::new(None),
                event_tx,
                shutdown: CancellationToken::new(),
                drivers: TaskTracker::new(),
            }),
        }
    }

    /// Subscribe to task events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Start a play task in the preview slot, superseding the current one.
    ///
    /// The player is resolved before anything else happens; resolution
    /// errors leave the preview slot untouched.
    pub fn play(&self, mut task: Task) -> Result<TaskHandle> {
        self.ensure_open()?;
        if task.mode() != TaskMode::Play {
            return Err(Error::validation("play() needs a play task"));
        }
        let program = self
            .inner
            .resolver
            .resolve_player(task.sources(), task.options().player.as_deref())?;
        task.bind_program(program)?;

        let shared = TaskShared::new(&task, self.inner.shutdown.child_token());
        let previous = self.inner.preview.lock().replace(shared.clone());
        if let Some(previous) = &previous {
            info!(
                task_id = %previous.id,
                superseded_by = %shared.id,
                "Superseding preview task"
            );
            previous.cancel.cancel();
        }

        let inner = self.inner.clone();
        let driver_shared = shared.clone();
        self.inner.drivers.spawn(async move {
            if let Some(previous) = previous {
                previous.finished().await;
            }
            inner.drive(task, driver_shared).await;
        });
        Ok(TaskHandle::new(shared))
    }

    /// Submit a download task to the bounded pool.
    ///
    /// The downloader and postprocessor chain are resolved first; a task
    /// that fails resolution never occupies a slot or a queue position.
    pub fn download(&self, mut task: Task) -> Result<TaskHandle> {
        self.ensure_open()?;
        if task.mode() != TaskMode::Download {
            return Err(Error::validation("download() needs a download task"));
        }
        let downloader = self
            .inner
            .resolver
            .resolve_downloader(task.sources(), task.options().downloader.as_deref())?;
        let chain = self
            .inner
            .resolver
            .resolve_postprocessors(&task.options().postprocessors)?;
        task.bind_program(downloader)?;
        task.bind_postprocessors(chain)?;

        let shared = TaskShared::new(&task, self.inner.shutdown.child_token());
        let handle = TaskHandle::new(shared.clone());
        let title = task.title().to_string();

        let submitted = self.inner.pool.lock().submit(Queued { task, shared });
        match submitted {
            Ok(entry) => self.inner.start(entry),
            Err(position) => {
                info!(task_id = %handle.id(), %title, position, "Download queued");
                self.inner.emit(TaskEvent::Queued {
                    task_id: handle.id(),
                    title,
                    position,
                });
            }
        }
        Ok(handle)
    }

    /// Cancel a task. Queued tasks are removed without starting; running
    /// tasks have their current process terminated and still finalise.
    ///
    /// Returns whether a live task with this id was found.
    pub fn cancel(&self, id: TaskId) -> bool {
        let queued = self.inner.pool.lock().remove_queued(id);
        if let Some(entry) = queued {
            entry.shared.cancel.cancel();
            self.inner.finish_unstarted(entry);
            return true;
        }

        let running = self.inner.pool.lock().running(id).cloned();
        let target = running.or_else(|| {
            self.inner
                .preview
                .lock()
                .as_ref()
                .filter(|shared| shared.id == id)
                .cloned()
        });
        match target {
            Some(shared) => {
                info!(task_id = %id, "Cancelling task");
                shared.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Change the download limit. Raising it admits queued tasks at once;
    /// lowering it never preempts running ones. Clamped to at least 1.
    pub fn set_max_concurrent(&self, max: usize) {
        let admissions = self.inner.pool.lock().set_max(max);
        info!(max = max.max(1), "Download limit changed");
        self.inner.apply(admissions);
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.pool.lock().max()
    }

    pub fn running_count(&self) -> usize {
        self.inner.pool.lock().running_len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.pool.lock().queued_len()
    }

    pub fn running_ids(&self) -> Vec<TaskId> {
        self.inner.pool.lock().running_ids()
    }

    /// Queued download ids in admission order.
    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.inner.pool.lock().queued_ids()
    }

    /// The play task holding the preview slot.
    pub fn preview_task(&self) -> Option<TaskId> {
        self.inner.preview.lock().as_ref().map(|shared| shared.id)
    }

    /// State of a live (running, queued or previewing) task.
    pub fn state_of(&self, id: TaskId) -> Option<TaskState> {
        let pooled = self.inner.pool.lock().get(id).map(|shared| shared.state());
        pooled.or_else(|| {
            self.inner
                .preview
                .lock()
                .as_ref()
                .filter(|shared| shared.id == id)
                .map(|shared| shared.state())
        })
    }

    /// Cancel everything and wait for every driver to finish. New
    /// submissions are rejected afterwards.
    pub async fn shutdown(&self) {
        info!("Shutting down task manager");
        self.inner.shutdown.cancel();
        let drained = self.inner.pool.lock().drain_queue();
        for entry in drained {
            self.inner.finish_unstarted(entry);
        }
        self.inner.drivers.close();
        self.inner.drivers.wait().await;
        debug!("Task manager stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::Other("task manager is shut down".to_string()));
        }
        Ok(())
    }
}

impl DownloadLimitAdjuster for TaskManager {
    fn set_max_concurrent_downloads(&self, limit: usize) {
        self.set_max_concurrent(limit);
    }

    fn get_max_concurrent_downloads(&self) -> usize {
        self.max_concurrent()
    }
}

impl Inner {
    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn start(self: &Arc<Self>, entry: Queued) {
        let inner = self.clone();
        self.drivers.spawn(async move {
            inner.drive(entry.task, entry.shared).await;
        });
    }

    fn apply(self: &Arc<Self>, admissions: Admissions) {
        for entry in admissions.dropped {
            self.finish_unstarted(entry);
        }
        for entry in admissions.started {
            debug!(task_id = %entry.shared.id, "Admitting queued download");
            self.start(entry);
        }
    }

    /// Give up the task's slot and admit whatever it frees.
    fn release(self: &Arc<Self>, shared: &TaskShared) {
        match shared.mode {
            TaskMode::Play => {
                let mut preview = self.preview.lock();
                if preview.as_ref().is_some_and(|current| current.id == shared.id) {
                    *preview = None;
                }
            }
            TaskMode::Download => {
                let admissions = self.pool.lock().release(shared.id);
                self.apply(admissions);
            }
        }
    }

    /// Finish a task that never got a slot.
    fn finish_unstarted(&self, mut entry: Queued) {
        if let Err(e) = entry.task.cancel_unstarted() {
            warn!(task_id = %entry.shared.id, error = %e, "Unexpected state for queued task");
        }
        info!(task_id = %entry.shared.id, "Queued task cancelled");
        let report = TaskReport::from_task(&entry.task, Bookkeeping::Skipped);
        entry.shared.set_state(entry.task.state());
        self.emit(TaskEvent::Finished {
            task_id: report.id,
            outcome: report.outcome.clone(),
            bookkeeping: report.bookkeeping.clone(),
        });
        entry.shared.complete(report);
    }

    /// Run a task to its terminal state and publish the report.
    async fn drive(self: Arc<Self>, mut task: Task, shared: Arc<TaskShared>) {
        let mut slot = SlotGuard::new(self.clone(), shared.clone());
        let task_id = task.id();

        self.recorder.attach(&task).await;
        info!(%task_id, mode = %task.mode(), title = task.title(), "Task started");
        self.emit(TaskEvent::Started {
            task_id,
            mode: task.mode(),
            title: task.title().to_string(),
        });

        let observer = DriverObserver {
            shared: &shared,
            events: &self.event_tx,
        };
        let ctx = StageContext::new(shared.cancel.clone(), &observer).with_stage_delay(self.stage_delay);
        let outcome = match task.mode() {
            TaskMode::Play => pipeline::run_play(&mut task, &ctx).await,
            TaskMode::Download => pipeline::run_download(&mut task, &ctx).await,
        };

        let bookkeeping = match self.recorder.finalize(&mut task, outcome).await {
            Ok(bookkeeping) => bookkeeping,
            Err(e) => {
                error!(%task_id, error = %e, "Failed to finalize task");
                Bookkeeping::Lost(e.to_string())
            }
        };
        shared.set_state(task.state());

        let report = TaskReport::from_task(&task, bookkeeping);
        info!(
            %task_id,
            outcome = %report.outcome,
            bookkeeping = ?report.bookkeeping,
            "Task finished"
        );

        // The next queued task may start before waiters see this report.
        slot.release();
        self.emit(TaskEvent::Finished {
            task_id,
            outcome: report.outcome.clone(),
            bookkeeping: report.bookkeeping.clone(),
        });
        shared.complete(report);
    }
}

/// Holds a task's pool or preview slot; releases it and publishes a
/// fallback report if the driver unwinds early.
struct SlotGuard {
    inner: Arc<Inner>,
    shared: Arc<TaskShared>,
    released: bool,
}

impl SlotGuard {
    fn new(inner: Arc<Inner>, shared: Arc<TaskShared>) -> Self {
        Self {
            inner,
            shared,
            released: false,
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release(&self.shared);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
        self.shared.complete_aborted();
    }
}

/// Mirrors stage progress into the task's shared state and the event bus.
struct DriverObserver<'a> {
    shared: &'a TaskShared,
    events: &'a broadcast::Sender<TaskEvent>,
}

impl StageObserver for DriverObserver<'_> {
    fn state_changed(&self, task: &Task) {
        self.shared.set_state(task.state());
    }

    fn stage_started(&self, task: &Task, plan: &StagePlan) {
        let program = task.program().map(|p| p.name().to_string()).unwrap_or_default();
        let _ = self.events.send(TaskEvent::StageStarted {
            task_id: task.id(),
            stage: plan.index,
            program,
            output: plan.output.clone(),
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::Source;
    use crate::program::{ConfigProgramResolver, ProgramSpec};
    use crate::config::ProgramsConfig;
    use crate::task::{DownloadPayload, TaskOptions, TaskOutcome};

    fn programs() -> ProgramsConfig {
        ProgramsConfig {
            players: vec![
                ProgramSpec::new("true-player", "sh").with_args(["-c", "exit 0", "player"]),
                ProgramSpec::new("sleepy-player", "sh").with_args(["-c", "sleep 30", "player"]),
                ProgramSpec::new("failing-player", "sh").with_args(["-c", "exit 3", "player"]),
            ],
            downloaders: vec![
                ProgramSpec::new("writer", "sh")
                    .with_args(["-c", "printf data > \"$1\"", "writer", "{output}"]),
                ProgramSpec::new("slow-writer", "sh").with_args([
                    "-c",
                    "sleep 0.3; printf data > \"$1\"",
                    "writer",
                    "{output}",
                ]),
                ProgramSpec::new("sleeper", "sh").with_args(["-c", "sleep 30", "sleeper", "{output}"]),
            ],
            postprocessors: vec![],
        }
    }

    fn manager(max: usize) -> TaskManager {
        TaskManager::new(
            TaskManagerConfig {
                max_concurrent_tasks: max,
                stage_delay: Duration::ZERO,
            },
            Arc::new(ConfigProgramResolver::new(&programs())),
            Arc::new(CompletionRecorder::without_catalog()),
        )
    }

    fn download(dir: &std::path::Path, name: &str, downloader: &str) -> Task {
        let options = TaskOptions {
            downloader: Some(downloader.to_string()),
            ..Default::default()
        };
        Task::download(
            name,
            "url",
            vec![Source::new("url", format!("https://example.com/{}.mp4", name))],
            options,
            DownloadPayload::new(dir.join(format!("{}.mp4", name)))
                .with_scratch(crate::task::ScratchDir::in_dir(dir)),
        )
    }

    fn play(name: &str, player: &str) -> Task {
        let options = TaskOptions {
            player: Some(player.to_string()),
            ..Default::default()
        };
        Task::play(
            name,
            "url",
            vec![Source::new("url", format!("https://example.com/{}.mp4", name))],
            options,
        )
    }

    #[tokio::test]
    async fn test_download_runs_to_done() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(2);
        let mut events = manager.subscribe();

        let handle = manager.download(download(dir.path(), "one", "writer")).unwrap();
        let report = handle.wait().await;

        assert_eq!(report.outcome, TaskOutcome::Succeeded);
        assert_eq!(handle.state(), TaskState::Done);
        assert_eq!(report.destination, Some(dir.path().join("one.mp4")));
        assert!(dir.path().join("one.mp4").exists());
        assert_eq!(manager.running_count(), 0);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(TaskEvent::Started { .. })));
        assert!(seen.iter().any(|e| matches!(e, TaskEvent::StageStarted { stage: 0, .. })));
        assert!(seen.last().is_some_and(TaskEvent::is_finished));
    }

    #[tokio::test]
    async fn test_resolution_error_takes_no_slot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(1);

        let err = manager
            .download(download(dir.path(), "bad", "no-such-downloader"))
            .unwrap_err();
        assert!(err.is_resolution_error());

        let empty = Task::download(
            "empty",
            "url",
            Vec::new(),
            TaskOptions::default(),
            DownloadPayload::new(dir.path().join("empty.mp4")),
        );
        assert!(matches!(manager.download(empty), Err(Error::EmptyTask)));
        assert_eq!(manager.running_count(), 0);
        assert_eq!(manager.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_overflow_is_queued_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(1);

        let first = manager.download(download(dir.path(), "a", "slow-writer")).unwrap();
        let second = manager.download(download(dir.path(), "b", "writer")).unwrap();
        let third = manager.download(download(dir.path(), "c", "writer")).unwrap();

        assert_eq!(manager.running_ids(), vec![first.id()]);
        assert_eq!(manager.queued_ids(), vec![second.id(), third.id()]);
        assert_eq!(manager.state_of(second.id()), Some(TaskState::ProgramBound));

        for handle in [&first, &second, &third] {
            assert!(handle.wait().await.outcome.is_success());
        }
        assert_eq!(manager.running_count(), 0);
        assert_eq!(manager.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_download() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(1);

        let running = manager.download(download(dir.path(), "a", "sleeper")).unwrap();
        let queued = manager.download(download(dir.path(), "b", "writer")).unwrap();

        assert!(manager.cancel(queued.id()));
        let report = queued.wait().await;
        assert_eq!(report.outcome, TaskOutcome::Cancelled);
        assert_eq!(report.bookkeeping, Bookkeeping::Skipped);
        assert_eq!(queued.state(), TaskState::Cancelled);
        assert_eq!(manager.running_ids(), vec![running.id()]);
        assert!(manager.queued_ids().is_empty());
        assert!(!manager.cancel(queued.id()));

        assert!(manager.cancel(running.id()));
        assert_eq!(running.wait().await.outcome, TaskOutcome::Cancelled);
        assert!(!dir.path().join("a.mp4").exists());
    }

    #[tokio::test]
    async fn test_new_play_supersedes_previous() {
        let manager = manager(1);

        let first = manager.play(play("first", "sleepy-player")).unwrap();
        let second = manager.play(play("second", "true-player")).unwrap();
        assert_eq!(manager.preview_task(), Some(second.id()));

        assert_eq!(first.wait().await.outcome, TaskOutcome::Cancelled);
        assert!(second.wait().await.outcome.is_success());
        assert_eq!(manager.preview_task(), None);
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_player_reports_exit_code() {
        let manager = manager(1);
        let handle = manager.play(play("x", "failing-player")).unwrap();
        let report = handle.wait().await;
        assert_eq!(report.exit_code(), 3);
        assert_eq!(handle.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_mode_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(1);
        assert!(manager.play(download(dir.path(), "a", "writer")).is_err());
        assert!(manager.download(play("b", "true-player")).is_err());
    }

    #[tokio::test]
    async fn test_limit_adjuster() {
        let manager = manager(2);
        let adjuster: &dyn DownloadLimitAdjuster = &manager;
        adjuster.set_max_concurrent_downloads(5);
        assert_eq!(adjuster.get_max_concurrent_downloads(), 5);
        adjuster.set_max_concurrent_downloads(0);
        assert_eq!(manager.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(1);
        let running = manager.download(download(dir.path(), "a", "sleeper")).unwrap();
        let queued = manager.download(download(dir.path(), "b", "writer")).unwrap();
        let playing = manager.play(play("p", "sleepy-player")).unwrap();

        manager.shutdown().await;

        assert_eq!(running.try_report().unwrap().outcome, TaskOutcome::Cancelled);
        assert_eq!(queued.try_report().unwrap().outcome, TaskOutcome::Cancelled);
        assert_eq!(playing.try_report().unwrap().outcome, TaskOutcome::Cancelled);
        assert!(manager.download(download(dir.path(), "c", "writer")).is_err());
    }
}
