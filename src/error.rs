//! Error types for the loader job engine.

use thiserror::Error;

/// Everything that can end a loader job early or reject it outright.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// The loader executable could not be spawned.
    #[error("Could not start {command}!")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on a running loader failed for a reason other than cancellation.
    #[error("Failed to wait for {command}: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Interrupted while waiting for the loader")]
    Interrupted,

    /// The loader ran but reported failure through its exit code.
    #[error("{action} failed with exit code {code}")]
    NonZeroExit { action: &'static str, code: i32 },

    #[error("Couldn't find device \"{description}\"")]
    DeviceNotFound { description: String },

    #[error("Job already running!")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoaderError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, LoaderError::Interrupted)
    }
}
