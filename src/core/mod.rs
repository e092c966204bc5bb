pub mod catalog;
pub mod commands;
pub mod models;
pub mod process;
pub mod relay;
pub mod runner;
pub mod status;

pub use catalog::{DeviceCatalog, Refresh};
pub use models::{
    Alert, AlertLevel, Board, JobEvent, JobKind, JobOutcome, JobReport, JobRequest, RunnerState,
};
pub use process::{CommandLine, ToolProcess};
pub use runner::JobRunner;
pub use status::{StatusCell, StatusReporter};
