//! External worker process capability
//!
//! [`WorkerLauncher`] starts a [`WorkerCommand`]; the returned
//! [`WorkerProcess`] hands out its two line streams once and can be waited
//! on or killed. The tokio implementation puts the worker in its own process
//! group so a kill, or dropping an unreaped process, takes any helpers it
//! forked down with it.

use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, error, warn};

use super::command::WorkerCommand;
use crate::error::ErrorCode;

/// Worker process failures
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker program not found: {0}")]
    CommandNotFound(String),

    #[error("Failed to spawn worker `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("Failed to kill worker {pid}: {message}")]
    KillFailed { pid: u32, message: String },

    #[error("Worker IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn code(&self) -> u16 {
        match self {
            Self::CommandNotFound(_) => ErrorCode::EXEC_COMMAND_NOT_FOUND,
            Self::SpawnFailed { .. } => ErrorCode::EXEC_SPAWN_FAILED,
            Self::MissingPipe(_) => ErrorCode::EXEC_GENERIC,
            Self::KillFailed { .. } => ErrorCode::EXEC_SUBPROCESS_FAILED,
            Self::Io(_) => ErrorCode::EXEC_OUTPUT_ERROR,
        }
    }
}

/// How a worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    Signal(i32),
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }

    /// Code recorded on the job; signals map to their negated number
    pub fn return_code(&self) -> i32 {
        match self {
            Self::Code(code) => *code,
            Self::Signal(signal) => -signal,
        }
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        Self::signal_status(status)
    }

    #[cfg(unix)]
    fn signal_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(Self::Signal).unwrap_or(Self::Code(-1))
    }

    #[cfg(not(unix))]
    fn signal_status(_status: std::process::ExitStatus) -> Self {
        Self::Code(-1)
    }
}

pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, WorkerError>> + Send>>;

/// A running worker
#[async_trait]
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Stdout lines; `None` after the first call
    fn stdout_lines(&mut self) -> Option<LineStream>;

    /// Stderr lines; `None` after the first call
    fn stderr_lines(&mut self) -> Option<LineStream>;

    async fn wait(&mut self) -> Result<WorkerExit, WorkerError>;

    /// Forcefully terminate the worker; a worker that already exited is not an error
    async fn kill(&mut self) -> Result<(), WorkerError>;
}

/// Starts worker processes
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn start(&self, command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, WorkerError>;
}

/// Launcher backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioWorkerLauncher;

impl TokioWorkerLauncher {
    fn configure_command(command: &WorkerCommand) -> Command {
        let mut cmd = Command::new(&command.program);

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn map_spawn_error(error: std::io::Error, command: &WorkerCommand) -> WorkerError {
        if error.kind() == std::io::ErrorKind::NotFound {
            WorkerError::CommandNotFound(command.program.clone())
        } else {
            WorkerError::SpawnFailed {
                command: command.display(),
                source: error,
            }
        }
    }
}

#[async_trait]
impl WorkerLauncher for TokioWorkerLauncher {
    async fn start(&self, command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, WorkerError> {
        debug!(
            "Spawning worker: {} (working_dir: {:?})",
            command.display(),
            command.working_dir
        );

        let mut child = Self::configure_command(command).spawn().map_err(|e| {
            error!("Failed to spawn '{}': {} (kind: {:?})", command.program, e, e.kind());
            Self::map_spawn_error(e, command)
        })?;

        let stdout = child.stdout.take().ok_or(WorkerError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(WorkerError::MissingPipe("stderr"))?;

        Ok(Box::new(TokioWorkerProcess {
            pid: child.id(),
            child,
            stdout: Some(stdout),
            stderr: Some(stderr),
            reaped: false,
        }))
    }
}

struct TokioWorkerProcess {
    pid: Option<u32>,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    reaped: bool,
}

impl Drop for TokioWorkerProcess {
    // `kill_on_drop` only reaches the direct child; take the whole group
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
    }
}

/// Strip the trailing newline (and carriage return)
fn normalize_line(mut line: String) -> String {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}

/// Line stream over a pipe. Invalid UTF-8 is replaced rather than failing
/// the read; an IO error is yielded once and ends the stream.
fn line_stream<R>(reader: R) -> LineStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    Box::pin(futures::stream::unfold(
        Some(BufReader::new(reader)),
        |reader| async move {
            let mut reader = reader?;
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => None,
                Ok(_) => {
                    let line = normalize_line(String::from_utf8_lossy(&buf).into_owned());
                    Some((Ok(line), Some(reader)))
                }
                Err(e) => Some((Err(WorkerError::Io(e)), None)),
            }
        },
    ))
}

/// SIGKILL the worker's process group. Returns `false` when the caller
/// should fall back to killing the child directly.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => true,
        Err(e) => {
            warn!(pid, error = %e, "killpg failed, killing worker directly");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> bool {
    false
}

#[async_trait]
impl WorkerProcess for TokioWorkerProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn stdout_lines(&mut self) -> Option<LineStream> {
        self.stdout.take().map(line_stream)
    }

    fn stderr_lines(&mut self) -> Option<LineStream> {
        self.stderr.take().map(line_stream)
    }

    async fn wait(&mut self) -> Result<WorkerExit, WorkerError> {
        let status = self.child.wait().await?;
        self.reaped = true;
        Ok(WorkerExit::from_status(status))
    }

    async fn kill(&mut self) -> Result<(), WorkerError> {
        if self.pid.is_some_and(kill_process_group) {
            return Ok(());
        }

        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already exited and reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(WorkerError::KillFailed {
                pid: self.pid.unwrap_or_default(),
                message: e.to_string(),
            }),
        }
    }
}
