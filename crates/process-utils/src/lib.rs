//! Supervision of external programs.
//!
//! A [`ProcessHandle`] wraps exactly one spawned OS process and exposes its
//! lifecycle as `spawn` -> `wait` with best-effort `cancel`. The supervisor
//! is purely mechanical: it never inspects what the program does, it only
//! reports how the process ended.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Errors raised while starting a process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open {} for {purpose}: {source}", path.display())]
    Redirect {
        purpose: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where one of the child's standard streams goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Redirect {
    /// Share the parent's stream.
    Inherit,
    /// Connect to the null device.
    #[default]
    Null,
    /// Read line by line and forward to `tracing` (output streams only).
    Capture,
    /// Read from (stdin) or truncate-and-write to (stdout/stderr) a file.
    File(PathBuf),
}

/// Everything needed to start one program.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
    pub stdin: Redirect,
    pub stdout: Redirect,
    pub stderr: Redirect,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            stdin: Redirect::Null,
            stdout: Redirect::Capture,
            stderr: Redirect::Capture,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, redirect: Redirect) -> Self {
        self.stdin = redirect;
        self
    }

    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = redirect;
        self
    }

    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = redirect;
        self
    }

    /// Program name used in logs.
    pub fn display_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited on its own with this code.
    Exited(i32),
    /// The process was terminated by a signal it was not asked to receive.
    Signaled(Option<i32>),
    /// Termination was requested through [`ProcessHandle::cancel`] before
    /// the process exited naturally.
    Cancelled,
    /// The exit status could not be collected.
    Unknown,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Exit code if the process exited on its own.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self::Signaled(status.signal())
        }
        #[cfg(not(unix))]
        {
            Self::Signaled(None)
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(Some(sig)) => write!(f, "killed by signal {}", sig),
            Self::Signaled(None) => write!(f, "killed by signal"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unknown => write!(f, "exit status unavailable"),
        }
    }
}

/// Handle to one running (or finished) process.
///
/// Cloning is cheap; every clone observes the same exit outcome.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    program: String,
    cancel: CancellationToken,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ProcessHandle {
    /// OS process id, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Request termination. The process is killed and [`wait`](Self::wait)
    /// resolves to [`ExitOutcome::Cancelled`] once the OS confirms the exit.
    /// Has no effect if the process already exited.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ExitOutcome {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => (*outcome).unwrap_or(ExitOutcome::Unknown),
            // The supervising task went away without reporting.
            Err(_) => ExitOutcome::Unknown,
        }
    }

    /// Exit outcome if the process has already finished.
    pub fn try_wait(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }
}

fn open_input(path: &Path) -> Result<Stdio, SpawnError> {
    File::open(path)
        .map(Stdio::from)
        .map_err(|source| SpawnError::Redirect {
            purpose: "stdin",
            path: path.to_path_buf(),
            source,
        })
}

fn open_output(path: &Path, purpose: &'static str) -> Result<Stdio, SpawnError> {
    File::create(path)
        .map(Stdio::from)
        .map_err(|source| SpawnError::Redirect {
            purpose,
            path: path.to_path_buf(),
            source,
        })
}

fn output_stdio(redirect: &Redirect, purpose: &'static str) -> Result<Stdio, SpawnError> {
    Ok(match redirect {
        Redirect::Inherit => Stdio::inherit(),
        Redirect::Null => Stdio::null(),
        Redirect::Capture => Stdio::piped(),
        Redirect::File(path) => open_output(path, purpose)?,
    })
}

fn forward_lines<R>(reader: R, program: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.to_ascii_lowercase().contains("error") {
                warn!(program = %program, stream, "{}", line);
            } else {
                debug!(program = %program, stream, "{}", line);
            }
        }
    });
}

/// Spawn one process described by `spec`.
///
/// Must be called from within a tokio runtime. Returns as soon as the OS has
/// created the process; a background task collects the exit status.
pub fn spawn(spec: &CommandSpec) -> Result<ProcessHandle, SpawnError> {
    let program = spec.display_name();

    let mut command = tokio_command(&spec.program);
    command.args(&spec.args).kill_on_drop(true);
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    if let Some(dir) = &spec.current_dir {
        command.current_dir(dir);
    }

    command.stdin(match &spec.stdin {
        Redirect::Inherit => Stdio::inherit(),
        Redirect::Null | Redirect::Capture => Stdio::null(),
        Redirect::File(path) => open_input(path)?,
    });
    command.stdout(output_stdio(&spec.stdout, "stdout")?);
    command.stderr(output_stdio(&spec.stderr, "stderr")?);

    let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, program.clone(), "stdout");
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, program.clone(), "stderr");
    }

    let cancel = CancellationToken::new();
    let (exit_tx, exit_rx) = watch::channel(None);

    let supervise_cancel = cancel.clone();
    let supervise_program = program.clone();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            biased;
            _ = supervise_cancel.cancelled() => {
                debug!(program = %supervise_program, ?pid, "Termination requested");
                if let Err(e) = child.start_kill() {
                    // Already reaped between the select arms.
                    debug!(program = %supervise_program, error = %e, "Kill failed");
                }
                if let Err(e) = child.wait().await {
                    warn!(program = %supervise_program, error = %e, "Error waiting for killed process");
                }
                ExitOutcome::Cancelled
            }
            status = child.wait() => match status {
                Ok(status) => ExitOutcome::from_status(status),
                Err(e) => {
                    warn!(program = %supervise_program, error = %e, "Error waiting for process");
                    ExitOutcome::Unknown
                }
            }
        };
        debug!(program = %supervise_program, ?pid, %outcome, "Process finished");
        let _ = exit_tx.send(Some(outcome));
    });

    info!(program = %program, ?pid, "Process started");

    Ok(ProcessHandle {
        pid,
        program,
        cancel,
        exit_rx,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let handle = spawn(&sh("exit 3")).unwrap();
        assert_eq!(handle.wait().await, ExitOutcome::Exited(3));
        assert_eq!(handle.try_wait(), Some(ExitOutcome::Exited(3)));
    }

    #[tokio::test]
    async fn test_success() {
        let handle = spawn(&sh("true")).unwrap();
        let outcome = handle.wait().await;
        assert!(outcome.success());
        assert_eq!(outcome.code(), Some(0));
    }

    #[tokio::test]
    async fn test_cancel_running_process() {
        let handle = spawn(&sh("sleep 30")).unwrap();
        assert!(handle.pid().is_some());
        handle.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("process should be killed");
        assert_eq!(outcome, ExitOutcome::Cancelled);
        assert!(outcome.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_after_exit_keeps_exit_code() {
        let handle = spawn(&sh("exit 0")).unwrap();
        assert_eq!(handle.wait().await, ExitOutcome::Exited(0));
        handle.cancel();
        assert_eq!(handle.wait().await, ExitOutcome::Exited(0));
    }

    #[tokio::test]
    async fn test_stdout_and_stdin_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "hello\n").unwrap();

        let spec = CommandSpec::new("cat")
            .stdin(Redirect::File(input))
            .stdout(Redirect::File(output.clone()));
        let handle = spawn(&spec).unwrap();
        assert!(handle.wait().await.success());
        assert_eq!(std::fs::read_to_string(output).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_environment_is_passed() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("env.txt");
        let spec = sh("printf %s \"$STREAM_HINT\"")
            .env("STREAM_HINT", "proxy")
            .stdout(Redirect::File(output.clone()));
        assert!(spawn(&spec).unwrap().wait().await.success());
        assert_eq!(std::fs::read_to_string(output).unwrap(), "proxy");
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let err = spawn(&CommandSpec::new("definitely-not-a-real-program-xyz")).unwrap_err();
        assert!(matches!(err, SpawnError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_missing_stdin_file() {
        let spec = CommandSpec::new("cat").stdin(Redirect::File("/nonexistent/input".into()));
        let err = spawn(&spec).unwrap_err();
        assert!(matches!(err, SpawnError::Redirect { purpose: "stdin", .. }));
    }

    #[test]
    fn test_display_name() {
        assert_eq!(CommandSpec::new("/usr/bin/mpv").display_name(), "mpv");
        assert_eq!(CommandSpec::new("streamlink").display_name(), "streamlink");
    }

    #[test]
    fn test_exit_outcome_display() {
        assert_eq!(ExitOutcome::Exited(2).to_string(), "exited with code 2");
        assert_eq!(ExitOutcome::Cancelled.to_string(), "cancelled");
    }
}
