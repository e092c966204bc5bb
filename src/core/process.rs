//! Spawning and supervising loader processes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LoaderError;

/// Exit code reported when the process ended without one (killed by a signal).
pub const NO_EXIT_CODE: i32 = -1;

/// A program plus its ordered argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    /// Program followed by its arguments, as passed to the OS.
    pub fn to_vec(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_vec().join(" "))
    }
}

/// A running loader process with both output streams piped.
pub struct ToolProcess {
    command: String,
    child: Child,
}

/// Start `command` as a child process.
///
/// A spawn failure is terminal for the caller: nothing is retried.
pub fn spawn(command: &CommandLine) -> Result<ToolProcess, LoaderError> {
    let name = command.program.display().to_string();

    let child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| {
            warn!(command = %name, error = %source, "Failed to start loader");
            LoaderError::Launch {
                command: name.clone(),
                source,
            }
        })?;

    info!(command = %command, pid = ?child.id(), "Loader started");

    Ok(ToolProcess {
        command: name,
        child,
    })
}

impl ToolProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the process to exit and return its exit code.
    ///
    /// If `cancel` fires first the process is killed and
    /// [`LoaderError::Interrupted`] is returned.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<i32, LoaderError> {
        let status = tokio::select! {
            status = self.child.wait() => status,
            _ = cancel.cancelled() => {
                info!(command = %self.command, "Wait interrupted, terminating loader");
                self.terminate().await;
                return Err(LoaderError::Interrupted);
            }
        };

        let status = status.map_err(|source| LoaderError::Wait {
            command: self.command.clone(),
            source,
        })?;

        let code = status.code().unwrap_or(NO_EXIT_CODE);
        debug!(command = %self.command, exit_code = code, "Loader exited");
        Ok(code)
    }

    /// Forcefully kill the process and reap it.
    pub async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            // Already exited processes end up here too.
            debug!(command = %self.command, error = %e, "Failed to kill loader");
        }
    }
}
