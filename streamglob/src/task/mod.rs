//! Tasks: one play or download operation over a set of sources.

mod scratch;
mod state;
pub mod template;

pub use scratch::{SCRATCH_PREFIX, ScratchDir};
pub use state::TaskState;
pub use template::{FilenameTemplate, RenderMode, TemplateContext};

use std::path::{Path, PathBuf};

use process_utils::{ExitOutcome, ProcessHandle};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Source;
use crate::pipeline::{StageInput, StagePlan};
use crate::program::{Program, SessionHints};
use crate::utils::filename::UnicodeForm;
use crate::{Error, Result};

/// Unique task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Options captured when the task is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    /// Player chosen by name; otherwise the resolver decides.
    pub player: Option<String>,
    /// Downloader chosen by name; otherwise the resolver decides.
    pub downloader: Option<String>,
    /// Postprocessor chain, in order.
    pub postprocessors: Vec<String>,
    /// Output filename template.
    pub template: Option<String>,
    pub session: SessionHints,
}

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed { code: Option<i32>, error: String },
    Cancelled,
}

impl TaskOutcome {
    pub fn failed(code: Option<i32>, error: impl Into<String>) -> Self {
        Self::Failed {
            code,
            error: error.into(),
        }
    }

    /// Map a process exit: 0 succeeds, anything else fails, an explicit
    /// termination request cancels.
    pub fn from_exit(exit: ExitOutcome) -> Self {
        match exit {
            ExitOutcome::Exited(0) => Self::Succeeded,
            ExitOutcome::Cancelled => Self::Cancelled,
            ExitOutcome::Exited(code) => Self::failed(Some(code), format!("exited with code {}", code)),
            other => Self::failed(None, other.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Exit status in the integer form reported to callers.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed { code, .. } => code.unwrap_or(-1),
            Self::Cancelled => -1,
        }
    }

    fn terminal_state(&self) -> TaskState {
        match self {
            Self::Succeeded => TaskState::Done,
            Self::Failed { .. } => TaskState::Failed,
            Self::Cancelled => TaskState::Cancelled,
        }
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { error, .. } => write!(f, "failed: {}", error),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Play or download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    Play,
    Download,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Download => "download",
        }
    }
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific task payload.
#[derive(Debug)]
pub enum TaskKind {
    Play,
    Download(DownloadPayload),
}

impl TaskKind {
    pub fn mode(&self) -> TaskMode {
        match self {
            Self::Play => TaskMode::Play,
            Self::Download(_) => TaskMode::Download,
        }
    }
}

/// State carried by download tasks only.
#[derive(Debug)]
pub struct DownloadPayload {
    destination: PathBuf,
    normalization: Option<UnicodeForm>,
    postprocessors: Vec<Program>,
    stage_outputs: Vec<PathBuf>,
    scratch: ScratchDir,
    wrote_destination: bool,
}

impl DownloadPayload {
    pub fn new(destination: PathBuf) -> Self {
        Self {
            destination,
            normalization: None,
            postprocessors: Vec::new(),
            stage_outputs: Vec::new(),
            scratch: ScratchDir::new(),
            wrote_destination: false,
        }
    }

    pub fn with_normalization(mut self, form: Option<UnicodeForm>) -> Self {
        self.normalization = form;
        self
    }

    pub fn with_scratch(mut self, scratch: ScratchDir) -> Self {
        self.scratch = scratch;
        self
    }

    /// Destination computed at creation; stages write here.
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Destination after Unicode normalisation of its file name.
    pub fn final_destination(&self) -> PathBuf {
        let Some(form) = self.normalization else {
            return self.destination.clone();
        };
        match self.destination.file_name().and_then(|n| n.to_str()) {
            Some(name) => self.destination.with_file_name(form.normalize(name)),
            None => self.destination.clone(),
        }
    }

    pub fn postprocessors(&self) -> &[Program] {
        &self.postprocessors
    }

    /// Downloader plus every postprocessor.
    pub fn stage_count(&self) -> usize {
        1 + self.postprocessors.len()
    }

    pub fn stage_outputs(&self) -> &[PathBuf] {
        &self.stage_outputs
    }

    pub fn last_output(&self) -> Option<&Path> {
        self.stage_outputs.last().map(PathBuf::as_path)
    }

    pub fn scratch_mut(&mut self) -> &mut ScratchDir {
        &mut self.scratch
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Whether a stage of this task was started with the destination as
    /// its output.
    pub fn wrote_destination(&self) -> bool {
        self.wrote_destination
    }

    /// Note that the process for `plan` is running. Only a spawned last
    /// stage counts as writing the destination.
    pub fn mark_spawned(&mut self, plan: &StagePlan) {
        if plan.output == self.destination {
            self.wrote_destination = true;
        }
    }

    /// Whether the destination lies inside the scratch directory, which is
    /// removed once the task finishes.
    pub fn destination_in_scratch(&self) -> bool {
        self.scratch
            .existing_path()
            .is_some_and(|scratch| self.destination.starts_with(scratch))
    }

    /// Input and output of stage `index`.
    ///
    /// Stage 0 reads the sources; stage n reads stage n-1's output. Every
    /// stage writes `scratch/<n>.tmp` except the last, which writes the
    /// destination.
    pub fn plan_stage(&mut self, index: usize) -> Result<StagePlan> {
        let stages = self.stage_count();
        if index >= stages {
            return Err(Error::validation(format!(
                "stage {} out of range, task has {} stages",
                index, stages
            )));
        }

        let input = if index == 0 {
            StageInput::Sources
        } else {
            let previous = self.stage_outputs.get(index - 1).ok_or_else(|| {
                Error::validation(format!("stage {} has no recorded output", index - 1))
            })?;
            StageInput::File(previous.clone())
        };

        let output = if index + 1 == stages {
            self.destination.clone()
        } else {
            self.scratch.path()?.join(format!("{}.tmp", index))
        };
        if self.destination_in_scratch() {
            return Err(Error::validation(format!(
                "destination {} is inside the scratch directory",
                self.destination.display()
            )));
        }

        Ok(StagePlan {
            index,
            input,
            output,
        })
    }

    /// Record the output of a finished stage.
    pub fn record_stage_output(&mut self, path: PathBuf) {
        self.stage_outputs.push(path);
    }
}

/// One play or download operation.
///
/// Slots fill in order: program, then process, then result. The result is
/// set exactly once.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    title: String,
    provider_id: String,
    listing_id: Option<i64>,
    sources: Vec<Source>,
    options: TaskOptions,
    kind: TaskKind,
    state: TaskState,
    program: Option<Program>,
    process: Option<ProcessHandle>,
    result: Option<TaskOutcome>,
    spawned: bool,
}

impl Task {
    fn new(
        title: impl Into<String>,
        provider_id: impl Into<String>,
        sources: Vec<Source>,
        options: TaskOptions,
        kind: TaskKind,
    ) -> Self {
        Self {
            id: TaskId::new(),
            title: title.into(),
            provider_id: provider_id.into(),
            listing_id: None,
            sources,
            options,
            kind,
            state: TaskState::Created,
            program: None,
            process: None,
            result: None,
            spawned: false,
        }
    }

    pub fn play(
        title: impl Into<String>,
        provider_id: impl Into<String>,
        sources: Vec<Source>,
        options: TaskOptions,
    ) -> Self {
        Self::new(title, provider_id, sources, options, TaskKind::Play)
    }

    pub fn download(
        title: impl Into<String>,
        provider_id: impl Into<String>,
        sources: Vec<Source>,
        options: TaskOptions,
        payload: DownloadPayload,
    ) -> Self {
        Self::new(title, provider_id, sources, options, TaskKind::Download(payload))
    }

    pub fn with_listing_id(mut self, listing_id: Option<i64>) -> Self {
        self.listing_id = listing_id;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn listing_id(&self) -> Option<i64> {
        self.listing_id
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// Catalog ids of the persisted sources.
    pub fn source_ids(&self) -> Vec<i64> {
        self.sources.iter().filter_map(|s| s.id).collect()
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn mode(&self) -> TaskMode {
        self.kind.mode()
    }

    pub fn download_payload(&self) -> Option<&DownloadPayload> {
        match &self.kind {
            TaskKind::Download(payload) => Some(payload),
            TaskKind::Play => None,
        }
    }

    pub fn download_payload_mut(&mut self) -> Option<&mut DownloadPayload> {
        match &mut self.kind {
            TaskKind::Download(payload) => Some(payload),
            TaskKind::Play => None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    pub fn result(&self) -> Option<&TaskOutcome> {
        self.result.as_ref()
    }

    /// Whether any process was ever spawned for this task.
    pub fn has_spawned(&self) -> bool {
        self.spawned
    }

    fn set_state(&mut self, target: TaskState) -> Result<()> {
        self.state = self.state.transition_to(target)?;
        Ok(())
    }

    /// Fill the program slot (Created -> ProgramBound).
    pub fn bind_program(&mut self, program: Program) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::EmptyTask);
        }
        if self.state != TaskState::Created {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: TaskState::ProgramBound.as_str().to_string(),
            });
        }
        self.set_state(TaskState::ProgramBound)?;
        self.program = Some(program);
        Ok(())
    }

    /// Attach the resolved postprocessor chain of a download task.
    pub fn bind_postprocessors(&mut self, chain: Vec<Program>) -> Result<()> {
        let state = self.state;
        match &mut self.kind {
            TaskKind::Download(payload) if !state.is_finalized() && payload.stage_outputs.is_empty() => {
                payload.postprocessors = chain;
                Ok(())
            }
            TaskKind::Download(_) => Err(Error::validation(
                "postprocessor chain cannot change once stages have run",
            )),
            TaskKind::Play => Err(Error::validation("play tasks have no postprocessors")),
        }
    }

    /// Fill the process slot (ProgramBound -> ProcessRunning).
    pub fn bind_process(&mut self, process: ProcessHandle) -> Result<()> {
        if self.program.is_none() || self.state != TaskState::ProgramBound {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: TaskState::ProcessRunning.as_str().to_string(),
            });
        }
        self.set_state(TaskState::ProcessRunning)?;
        self.process = Some(process);
        self.spawned = true;
        Ok(())
    }

    /// Re-arm the slots for the next download stage
    /// (ProcessRunning -> ProgramBound).
    pub fn next_stage(&mut self, program: Program) -> Result<()> {
        if self.mode() != TaskMode::Download || self.state != TaskState::ProcessRunning {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: TaskState::ProgramBound.as_str().to_string(),
            });
        }
        self.set_state(TaskState::ProgramBound)?;
        self.program = Some(program);
        self.process = None;
        Ok(())
    }

    /// Clear the program and process slots so the task can be driven again.
    /// Identity and stage outputs are kept.
    pub fn reset(&mut self) -> Result<()> {
        if self.state.is_finalized() {
            return Err(Error::TaskAlreadyFinalized {
                task_id: self.id.to_string(),
            });
        }
        if self.state != TaskState::Created {
            self.set_state(TaskState::Created)?;
        }
        self.program = None;
        self.process = None;
        Ok(())
    }

    /// Set the result slot and enter `Finalizing`.
    ///
    /// Returns `Ok(true)` the first time. Repeating the same outcome is a
    /// no-op returning `Ok(false)`; a different outcome is an error.
    pub fn finalize(&mut self, outcome: TaskOutcome) -> Result<bool> {
        if let Some(existing) = &self.result {
            if *existing == outcome {
                return Ok(false);
            }
            return Err(Error::TaskAlreadyFinalized {
                task_id: self.id.to_string(),
            });
        }
        self.set_state(TaskState::Finalizing)?;
        self.result = Some(outcome);
        Ok(true)
    }

    /// Leave `Finalizing` for the terminal state matching the result.
    pub fn complete(&mut self) -> Result<TaskState> {
        let target = match (&self.result, self.state) {
            (Some(outcome), TaskState::Finalizing) => outcome.terminal_state(),
            (Some(_), state) if state.is_terminal() => return Ok(state),
            _ => {
                return Err(Error::InvalidStateTransition {
                    from: self.state.as_str().to_string(),
                    to: "terminal".to_string(),
                });
            }
        };
        self.set_state(target)?;
        self.process = None;
        Ok(target)
    }

    /// Cancel a task that never started a process.
    pub fn cancel_unstarted(&mut self) -> Result<()> {
        if !matches!(self.state, TaskState::Created | TaskState::ProgramBound) {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: TaskState::Cancelled.as_str().to_string(),
            });
        }
        self.set_state(TaskState::Cancelled)?;
        self.result = Some(TaskOutcome::Cancelled);
        self.program = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{ProgramRole, ProgramSpec};

    fn program(name: &str, role: ProgramRole) -> Program {
        Program::new(ProgramSpec::new(name, name), role)
    }

    fn sources() -> Vec<Source> {
        vec![Source::new("p", "https://example.com/a.mp4")]
    }

    fn download_task(dest: &Path, scratch_parent: &Path) -> Task {
        Task::download(
            "A",
            "p",
            sources(),
            TaskOptions::default(),
            DownloadPayload::new(dest.to_path_buf()).with_scratch(ScratchDir::in_dir(scratch_parent)),
        )
    }

    #[test]
    fn test_outcome_from_exit() {
        assert_eq!(TaskOutcome::from_exit(ExitOutcome::Exited(0)), TaskOutcome::Succeeded);
        assert_eq!(TaskOutcome::from_exit(ExitOutcome::Cancelled), TaskOutcome::Cancelled);
        assert!(matches!(
            TaskOutcome::from_exit(ExitOutcome::Exited(3)),
            TaskOutcome::Failed { code: Some(3), .. }
        ));
        assert!(matches!(
            TaskOutcome::from_exit(ExitOutcome::Signaled(Some(9))),
            TaskOutcome::Failed { code: None, .. }
        ));
        assert_eq!(TaskOutcome::failed(Some(2), "x").exit_code(), 2);
    }

    #[test]
    fn test_task_id_round_trip() {
        let id = TaskId::new();
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert!("nope".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_slots_fill_in_order() {
        let mut task = Task::play("A", "p", sources(), TaskOptions::default());
        assert_eq!(task.state(), TaskState::Created);
        assert!(task.next_stage(program("mpv", ProgramRole::Player)).is_err());

        task.bind_program(program("mpv", ProgramRole::Player)).unwrap();
        assert!(task.bind_program(program("vlc", ProgramRole::Player)).is_err());
        assert_eq!(task.program().unwrap().name(), "mpv");
        assert!(!task.has_spawned());

        assert!(task.finalize(TaskOutcome::Cancelled).unwrap());
        assert_eq!(task.complete().unwrap(), TaskState::Cancelled);
    }

    #[test]
    fn test_empty_task_rejected() {
        let mut task = Task::play("A", "p", Vec::new(), TaskOptions::default());
        assert!(matches!(
            task.bind_program(program("mpv", ProgramRole::Player)),
            Err(Error::EmptyTask)
        ));
    }

    #[test]
    fn test_finalize_idempotent() {
        let mut task = Task::play("A", "p", sources(), TaskOptions::default());
        task.bind_program(program("mpv", ProgramRole::Player)).unwrap();

        let failed = TaskOutcome::failed(Some(1), "exited with code 1");
        assert!(task.finalize(failed.clone()).unwrap());
        assert!(!task.finalize(failed).unwrap());
        assert!(matches!(
            task.finalize(TaskOutcome::Succeeded),
            Err(Error::TaskAlreadyFinalized { .. })
        ));
        assert_eq!(task.complete().unwrap(), TaskState::Failed);
        assert_eq!(task.complete().unwrap(), TaskState::Failed);
        assert!(!task.finalize(TaskOutcome::failed(Some(1), "exited with code 1")).unwrap());
    }

    #[test]
    fn test_reset_keeps_identity_and_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = download_task(&dir.path().join("out.mp4"), dir.path());
        let id = task.id();
        task.bind_program(program("copy", ProgramRole::Downloader)).unwrap();
        task.download_payload_mut()
            .unwrap()
            .record_stage_output(PathBuf::from("/x/0.tmp"));

        task.reset().unwrap();
        assert_eq!(task.state(), TaskState::Created);
        assert!(task.program().is_none());
        assert_eq!(task.id(), id);
        assert_eq!(task.download_payload().unwrap().stage_outputs().len(), 1);

        task.finalize(TaskOutcome::Succeeded).unwrap();
        assert!(matches!(task.reset(), Err(Error::TaskAlreadyFinalized { .. })));
    }

    #[test]
    fn test_cancel_unstarted() {
        let mut task = Task::play("A", "p", sources(), TaskOptions::default());
        task.bind_program(program("mpv", ProgramRole::Player)).unwrap();
        task.cancel_unstarted().unwrap();
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(task.result(), Some(&TaskOutcome::Cancelled));
        assert!(task.cancel_unstarted().is_err());
    }

    #[test]
    fn test_plan_without_postprocessors_writes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.mp4");
        let mut task = download_task(&dest, dir.path());
        let payload = task.download_payload_mut().unwrap();

        let plan = payload.plan_stage(0).unwrap();
        assert_eq!(plan.input, StageInput::Sources);
        assert_eq!(plan.output, dest);
        assert!(!payload.wrote_destination());
        payload.mark_spawned(&plan);
        assert!(payload.wrote_destination());
        assert!(payload.scratch().existing_path().is_none());
        assert!(payload.plan_stage(1).is_err());
    }

    #[test]
    fn test_plan_chains_through_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.mp4");
        let mut task = download_task(&dest, dir.path());
        task.bind_postprocessors(vec![
            program("a", ProgramRole::Postprocessor),
            program("b", ProgramRole::Postprocessor),
        ])
        .unwrap();
        let payload = task.download_payload_mut().unwrap();
        assert_eq!(payload.stage_count(), 3);

        let stage0 = payload.plan_stage(0).unwrap();
        let scratch = payload.scratch().existing_path().unwrap().to_path_buf();
        assert_eq!(stage0.output, scratch.join("0.tmp"));
        payload.mark_spawned(&stage0);
        assert!(!payload.wrote_destination());
        assert!(payload.plan_stage(1).is_err());

        payload.record_stage_output(stage0.output.clone());
        let stage1 = payload.plan_stage(1).unwrap();
        assert_eq!(stage1.input, StageInput::File(scratch.join("0.tmp")));
        assert_eq!(stage1.output, scratch.join("1.tmp"));

        payload.record_stage_output(stage1.output.clone());
        let stage2 = payload.plan_stage(2).unwrap();
        assert_eq!(stage2.input, StageInput::File(scratch.join("1.tmp")));
        assert_eq!(stage2.output, dest);
    }

    #[test]
    fn test_final_destination_normalizes_file_name() {
        let payload = DownloadPayload::new(PathBuf::from("/media/Cafe\u{301}.mp4"))
            .with_normalization(Some(UnicodeForm::Nfc));
        assert_eq!(payload.final_destination(), PathBuf::from("/media/Caf\u{e9}.mp4"));
        let plain = DownloadPayload::new(PathBuf::from("/media/Cafe\u{301}.mp4"));
        assert_eq!(plain.final_destination(), PathBuf::from("/media/Cafe\u{301}.mp4"));
    }

    #[test]
    fn test_plan_rejects_destination_in_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let mut scratch = ScratchDir::in_dir(dir.path());
        let dest = scratch.path().unwrap().join("final.mp4");
        let mut payload = DownloadPayload::new(dest).with_scratch(scratch);

        assert!(payload.destination_in_scratch());
        assert!(matches!(payload.plan_stage(0), Err(Error::Validation(_))));
        assert!(!payload.wrote_destination());
    }

    #[test]
    fn test_play_has_no_postprocessors() {
        let mut task = Task::play("A", "p", sources(), TaskOptions::default());
        assert!(task.bind_postprocessors(Vec::new()).is_err());
        assert!(task.download_payload().is_none());
    }
}
