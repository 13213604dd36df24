//! Process execution for tasks: the single play stage and the chained
//! download stages (fetch, then each postprocessor).

mod stage;

pub use stage::{StageInput, StagePlan};

use std::time::Duration;

use process_utils::{ExitOutcome, ProcessHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::task::{Task, TaskOutcome};
use crate::utils::fs::ensure_parent_dir;
use crate::{Error, Result};

/// Receives progress notifications while a task runs.
pub trait StageObserver: Send + Sync {
    /// The task's state changed.
    fn state_changed(&self, _task: &Task) {}

    /// A stage process was spawned.
    fn stage_started(&self, _task: &Task, _plan: &StagePlan) {}
}

impl StageObserver for () {}

/// Inputs shared by every stage of one run.
pub struct StageContext<'a> {
    pub cancel: CancellationToken,
    /// Pause between download stages.
    pub stage_delay: Duration,
    pub observer: &'a dyn StageObserver,
}

impl<'a> StageContext<'a> {
    pub fn new(cancel: CancellationToken, observer: &'a dyn StageObserver) -> Self {
        Self {
            cancel,
            stage_delay: Duration::ZERO,
            observer,
        }
    }

    pub fn with_stage_delay(mut self, delay: Duration) -> Self {
        self.stage_delay = delay;
        self
    }
}

/// Wait for `handle`, killing it if `cancel` fires first.
pub async fn wait_or_cancel(handle: &ProcessHandle, cancel: &CancellationToken) -> ExitOutcome {
    tokio::select! {
        biased;
        exit = handle.wait() => exit,
        _ = cancel.cancelled() => {
            debug!(program = handle.program(), "Cancelling process");
            handle.cancel();
            handle.wait().await
        }
    }
}

/// Run the player of a play task until it exits or is cancelled.
pub async fn run_play(task: &mut Task, ctx: &StageContext<'_>) -> TaskOutcome {
    match drive_play(task, ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(task_id = %task.id(), error = %e, "Play task failed");
            TaskOutcome::failed(None, e.to_string())
        }
    }
}

async fn drive_play(task: &mut Task, ctx: &StageContext<'_>) -> Result<TaskOutcome> {
    if ctx.cancel.is_cancelled() {
        return Ok(TaskOutcome::Cancelled);
    }
    let program = bound_program(task)?;
    let command = program.play_command(task.sources(), &task.options().session)?;

    let handle = process_utils::spawn(&command)?;
    task.bind_process(handle.clone())?;
    info!(
        task_id = %task.id(),
        program = program.name(),
        pid = ?handle.pid(),
        "Player started"
    );
    ctx.observer.state_changed(task);

    let exit = wait_or_cancel(&handle, &ctx.cancel).await;
    debug!(task_id = %task.id(), %exit, "Player exited");
    Ok(TaskOutcome::from_exit(exit))
}

/// Run every stage of a download task in order.
///
/// Stops at the first stage that fails or is cancelled. A stage that exits
/// successfully without producing its output file fails the task.
pub async fn run_download(task: &mut Task, ctx: &StageContext<'_>) -> TaskOutcome {
    match drive_download(task, ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(task_id = %task.id(), error = %e, "Download stage failed");
            TaskOutcome::failed(None, e.to_string())
        }
    }
}

async fn drive_download(task: &mut Task, ctx: &StageContext<'_>) -> Result<TaskOutcome> {
    let stages = task
        .download_payload()
        .map(|p| p.stage_count())
        .ok_or_else(|| Error::validation("not a download task"))?;

    for index in 0..stages {
        if ctx.cancel.is_cancelled() {
            return Ok(TaskOutcome::Cancelled);
        }

        if index > 0 {
            if !ctx.stage_delay.is_zero() {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Ok(TaskOutcome::Cancelled),
                    _ = tokio::time::sleep(ctx.stage_delay) => {}
                }
            }
            let next = task
                .download_payload()
                .and_then(|p| p.postprocessors().get(index - 1))
                .cloned()
                .ok_or_else(|| Error::validation(format!("no program for stage {}", index)))?;
            task.next_stage(next)?;
            ctx.observer.state_changed(task);
        }

        let plan = task
            .download_payload_mut()
            .ok_or_else(|| Error::validation("not a download task"))?
            .plan_stage(index)?;
        ensure_parent_dir(&plan.output).await?;

        let program = bound_program(task)?;
        let command =
            program.stage_command(task.sources(), &plan.input, &plan.output, &task.options().session)?;

        let handle = process_utils::spawn(&command)?;
        task.bind_process(handle.clone())?;
        if let Some(payload) = task.download_payload_mut() {
            payload.mark_spawned(&plan);
        }
        info!(
            task_id = %task.id(),
            stage = index,
            stages,
            program = program.name(),
            output = %plan.output.display(),
            "Stage started"
        );
        ctx.observer.state_changed(task);
        ctx.observer.stage_started(task, &plan);

        let exit = wait_or_cancel(&handle, &ctx.cancel).await;
        let outcome = TaskOutcome::from_exit(exit);
        if !outcome.is_success() {
            warn!(task_id = %task.id(), stage = index, %exit, "Stage did not succeed");
            return Ok(outcome);
        }

        if !tokio::fs::try_exists(&plan.output).await.unwrap_or(false) {
            return Ok(TaskOutcome::failed(
                None,
                format!(
                    "stage {} ({}) produced no output at {}",
                    index,
                    program.name(),
                    plan.output.display()
                ),
            ));
        }

        debug!(task_id = %task.id(), stage = index, "Stage finished");
        if let Some(payload) = task.download_payload_mut() {
            payload.record_stage_output(plan.output);
        }
    }

    Ok(TaskOutcome::Succeeded)
}

fn bound_program(task: &Task) -> Result<crate::program::Program> {
    task.program()
        .cloned()
        .ok_or_else(|| Error::validation(format!("task {} has no program bound", task.id())))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::Source;
    use crate::program::{Program, ProgramRole, ProgramSpec};
    use crate::task::{DownloadPayload, ScratchDir, TaskOptions, TaskState};
    use std::path::Path;

    fn sh(name: &str, script: &str, role: ProgramRole) -> Program {
        Program::new(
            ProgramSpec::new(name, "sh").with_args(["-c", script, "sh", "{input}", "{output}"]),
            role,
        )
    }

    fn download(dir: &Path, chain: Vec<Program>, fetch: Program) -> Task {
        let mut task = Task::download(
            "clip",
            "test",
            vec![Source::new("test", "https://example.com/clip.mp4")],
            TaskOptions::default(),
            DownloadPayload::new(dir.join("out").join("clip.mp4"))
                .with_scratch(ScratchDir::in_dir(dir)),
        );
        task.bind_program(fetch).unwrap();
        task.bind_postprocessors(chain).unwrap();
        task
    }

    #[tokio::test]
    async fn test_single_stage_writes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = sh("fetch", "printf raw > \"$2\"", ProgramRole::Downloader);
        let mut task = download(dir.path(), Vec::new(), fetch);

        let ctx = StageContext::new(CancellationToken::new(), &());
        let outcome = run_download(&mut task, &ctx).await;

        assert_eq!(outcome, TaskOutcome::Succeeded);
        let payload = task.download_payload().unwrap();
        assert_eq!(payload.stage_outputs(), [dir.path().join("out").join("clip.mp4")]);
        assert_eq!(std::fs::read(payload.destination()).unwrap(), b"raw");
        assert!(payload.scratch().existing_path().is_none());
        assert_eq!(task.state(), TaskState::ProcessRunning);
    }

    #[tokio::test]
    async fn test_stages_chain_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = sh("fetch", "printf 0 > \"$2\"", ProgramRole::Downloader);
        let chain = vec![
            sh("a", "cat \"$1\" > \"$2\"; printf 1 >> \"$2\"", ProgramRole::Postprocessor),
            sh("b", "cat \"$1\" > \"$2\"; printf 2 >> \"$2\"", ProgramRole::Postprocessor),
        ];
        let mut task = download(dir.path(), chain, fetch);

        let ctx = StageContext::new(CancellationToken::new(), &())
            .with_stage_delay(Duration::from_millis(5));
        assert_eq!(run_download(&mut task, &ctx).await, TaskOutcome::Succeeded);

        let payload = task.download_payload().unwrap();
        let scratch = payload.scratch().existing_path().unwrap().to_path_buf();
        assert_eq!(
            payload.stage_outputs(),
            [scratch.join("0.tmp"), scratch.join("1.tmp"), payload.destination().to_path_buf()]
        );
        assert_eq!(std::fs::read(payload.destination()).unwrap(), b"012");
        assert_eq!(task.program().unwrap().name(), "b");
    }

    #[tokio::test]
    async fn test_failed_stage_stops_chain() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = sh("fetch", "printf 0 > \"$2\"", ProgramRole::Downloader);
        let chain = vec![
            sh("bad", "exit 4", ProgramRole::Postprocessor),
            sh("never", "printf x > \"$2\"", ProgramRole::Postprocessor),
        ];
        let mut task = download(dir.path(), chain, fetch);

        let ctx = StageContext::new(CancellationToken::new(), &());
        let outcome = run_download(&mut task, &ctx).await;

        assert!(matches!(outcome, TaskOutcome::Failed { code: Some(4), .. }));
        assert_eq!(task.download_payload().unwrap().stage_outputs().len(), 1);
        assert_eq!(task.program().unwrap().name(), "bad");
    }

    #[tokio::test]
    async fn test_missing_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = sh("fetch", "true", ProgramRole::Downloader);
        let mut task = download(dir.path(), Vec::new(), fetch);

        let ctx = StageContext::new(CancellationToken::new(), &());
        let outcome = run_download(&mut task, &ctx).await;
        match outcome {
            TaskOutcome::Failed { error, .. } => assert!(error.contains("produced no output")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_running_stage() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = sh("fetch", "sleep 30", ProgramRole::Downloader);
        let mut task = download(dir.path(), Vec::new(), fetch);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let ctx = StageContext::new(cancel, &());
        let outcome = tokio::time::timeout(Duration::from_secs(10), run_download(&mut task, &ctx))
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert!(task.has_spawned());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_task_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Program::new(
            ProgramSpec::new("missing", "/definitely/not/a/program").with_args(["{output}"]),
            ProgramRole::Downloader,
        );
        let mut task = download(dir.path(), Vec::new(), fetch);

        let ctx = StageContext::new(CancellationToken::new(), &());
        let outcome = run_download(&mut task, &ctx).await;
        assert!(matches!(outcome, TaskOutcome::Failed { code: None, .. }));
        assert!(!task.has_spawned());
        assert!(!task.download_payload().unwrap().wrote_destination());
        assert_eq!(task.state(), TaskState::ProgramBound);
    }

    #[tokio::test]
    async fn test_play_exit_code() {
        let mut task = Task::play(
            "clip",
            "test",
            vec![Source::new("test", "https://example.com/clip.mp4")],
            TaskOptions::default(),
        );
        task.bind_program(Program::new(
            ProgramSpec::new("player", "sh").with_args(["-c", "exit 2", "sh", "{sources}"]),
            ProgramRole::Player,
        ))
        .unwrap();

        let ctx = StageContext::new(CancellationToken::new(), &());
        let outcome = run_play(&mut task, &ctx).await;
        assert!(matches!(outcome, TaskOutcome::Failed { code: Some(2), .. }));
        assert!(task.has_spawned());
    }
}
