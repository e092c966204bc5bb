use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LoaderError;

/// Alchitry board variant. Selects the EEPROM data file, the device
/// description reported by the loader and whether the Au bridge bitstream
/// is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Board {
    Au,
    Cu,
}

impl Board {
    /// Description the loader prints for this board in its device list.
    pub fn description(&self) -> &'static str {
        match self {
            Board::Au => "Alchitry Au",
            Board::Cu => "Alchitry Cu",
        }
    }

    /// The Cu can only be programmed through its flash.
    pub fn supports_ram_programming(&self) -> bool {
        matches!(self, Board::Au)
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A job as requested by the front end, with its input parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRequest {
    Enumerate,
    FlashEeprom {
        board: Board,
    },
    Program {
        bin: PathBuf,
        board: Board,
        use_flash: bool,
    },
    Erase {
        board: Board,
    },
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Enumerate => JobKind::Enumerate,
            JobRequest::FlashEeprom { .. } => JobKind::FlashEeprom,
            JobRequest::Program { .. } => JobKind::Program,
            JobRequest::Erase { .. } => JobKind::Erase,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Enumerate,
    FlashEeprom,
    Program,
    Erase,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Enumerate => write!(f, "enumerate"),
            JobKind::FlashEeprom => write!(f, "flash-eeprom"),
            JobKind::Program => write!(f, "program"),
            JobKind::Erase => write!(f, "erase"),
        }
    }
}

/// What the runner is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running { id: Uuid, kind: JobKind },
}

/// Terminal state of a job.
#[derive(Debug)]
pub enum JobOutcome {
    /// The loader ran to completion. Only a device listing may complete
    /// with a non-zero code, which the loader uses to say "no devices".
    Completed { exit_code: i32 },
    Failed(LoaderError),
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed { exit_code } => write!(f, "completed (exit code {exit_code})"),
            JobOutcome::Failed(e) => write!(f, "failed: {e}"),
            JobOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structured result delivered with [`JobEvent::Finished`].
#[derive(Debug)]
pub struct JobReport {
    pub id: Uuid,
    pub kind: JobKind,
    pub outcome: JobOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Error,
}

/// A message the front end should surface to the user, separate from the
/// running status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
}

impl Alert {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Error,
            message: message.into(),
        }
    }
}

/// Notifications sent from the runner to the front end.
#[derive(Debug)]
pub enum JobEvent {
    /// The status changed; read it with `JobRunner::status()`.
    Progress,
    Alert(Alert),
    /// Sent exactly once per job, after the runner went back to idle.
    Finished(JobReport),
}
