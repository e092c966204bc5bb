//! Single-job runner for the loader.
//!
//! At most one job runs per [`JobRunner`]. Each job body runs on its own
//! tokio task, reports through the shared [`StatusReporter`] and always ends
//! the same way: a final progress event, the transition back to idle, then
//! exactly one [`JobEvent::Finished`].

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::catalog::DeviceCatalog;
use super::commands;
use super::models::{
    Alert, Board, JobEvent, JobKind, JobOutcome, JobReport, JobRequest, RunnerState,
};
use super::process::{self, CommandLine};
use super::relay::RelayPair;
use super::status::{StatusCell, StatusReporter};
use crate::config::ToolPaths;
use crate::error::LoaderError;

pub const STARTING: &str = "Starting...";
pub const LOOKING_FOR_DEVICE: &str = "Looking for device...";
pub const DONE: &str = "Done.";
pub const LAUNCH_FAILED: &str = "Failed to start loader!";
pub const INTERRUPTED: &str = "Interrupted!";
pub const DEVICE_NOT_FOUND: &str = "Couldn't find device!";
pub const EEPROM_FAILED: &str = "Failed to program EEPROM!";
pub const EEPROM_REPLUG: &str = "Unplug and replug the device to reload the EEPROM contents!";
pub const PROGRAM_FAILED: &str = "Failed to program device!";
pub const ERASE_FAILED: &str = "Failed to erase device!";

struct ActiveJob {
    id: Uuid,
    kind: JobKind,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

type Slot = Arc<Mutex<Option<ActiveJob>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<ActiveJob>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the running slot when the job task ends, whichever way it ends.
struct RunningGuard {
    slot: Slot,
    id: Uuid,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        if slot.as_ref().is_some_and(|job| job.id == self.id) {
            *slot = None;
        }
    }
}

pub struct JobRunner {
    tools: Arc<ToolPaths>,
    catalog: Arc<DeviceCatalog>,
    reporter: StatusReporter,
    active: Slot,
}

impl JobRunner {
    /// Create a runner and the receiving end of its event channel.
    pub fn new(tools: ToolPaths) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = Self {
            catalog: Arc::new(DeviceCatalog::new(tools.clone())),
            tools: Arc::new(tools),
            reporter: StatusReporter::new(StatusCell::new(), tx),
            active: Arc::new(Mutex::new(None)),
        };
        (runner, rx)
    }

    /// Latest status line of the current or most recent job.
    pub fn status(&self) -> String {
        self.reporter.status().get()
    }

    /// Devices found by the most recent listing.
    pub fn devices(&self) -> Arc<[String]> {
        self.catalog.snapshot()
    }

    pub fn state(&self) -> RunnerState {
        match lock(&self.active).as_ref() {
            Some(job) => RunnerState::Running {
                id: job.id,
                kind: job.kind,
            },
            None => RunnerState::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.active).is_some()
    }

    pub fn start_enumerate(&self) -> Result<Uuid, LoaderError> {
        self.start(JobRequest::Enumerate)
    }

    pub fn start_flash_eeprom(&self, board: Board) -> Result<Uuid, LoaderError> {
        self.start(JobRequest::FlashEeprom { board })
    }

    pub fn start_program(
        &self,
        bin: impl AsRef<Path>,
        board: Board,
        use_flash: bool,
    ) -> Result<Uuid, LoaderError> {
        self.start(JobRequest::Program {
            bin: bin.as_ref().to_path_buf(),
            board,
            use_flash,
        })
    }

    pub fn start_erase(&self, board: Board) -> Result<Uuid, LoaderError> {
        self.start(JobRequest::Erase { board })
    }

    /// Start `request` on a background task, or reject it if a job is
    /// already running. The check and the transition to running happen
    /// under the same lock.
    pub fn start(&self, request: JobRequest) -> Result<Uuid, LoaderError> {
        let mut slot = lock(&self.active);
        if let Some(job) = slot.as_ref() {
            warn!(running = %job.kind, requested = %request.kind(), "Job already running");
            return Err(LoaderError::AlreadyRunning);
        }

        let id = Uuid::now_v7();
        let kind = request.kind();
        let cancel = CancellationToken::new();

        self.reporter.status().set(STARTING);

        let ctx = JobContext {
            tools: self.tools.clone(),
            catalog: self.catalog.clone(),
            reporter: self.reporter.clone(),
            cancel: cancel.clone(),
        };
        let active = self.active.clone();
        let span = info_span!("job", id = %id, kind = %kind);

        let handle = tokio::spawn(
            async move {
                let guard = RunningGuard { slot: active, id };
                run_job(id, request, ctx, guard).await;
            }
            .instrument(span),
        );

        *slot = Some(ActiveJob {
            id,
            kind,
            cancel,
            handle: Some(handle),
        });

        Ok(id)
    }

    /// Ask the running job to stop. Returns false when nothing was running.
    pub fn stop(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(job) => {
                info!(id = %job.id, kind = %job.kind, "Stopping job");
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for the background task of the current job, if any, to end.
    pub async fn join(&self) {
        let handle = lock(&self.active).as_mut().and_then(|job| job.handle.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Job task failed");
            }
        }
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        if let Some(job) = lock(&self.active).as_ref() {
            job.cancel.cancel();
        }
    }
}

/// Everything a job body needs, cloned out of the runner.
struct JobContext {
    tools: Arc<ToolPaths>,
    catalog: Arc<DeviceCatalog>,
    reporter: StatusReporter,
    cancel: CancellationToken,
}

async fn run_job(id: Uuid, request: JobRequest, ctx: JobContext, guard: RunningGuard) {
    let started_at = Utc::now();
    let kind = request.kind();
    info!("Job started");

    let outcome = match request {
        JobRequest::Enumerate => enumerate(&ctx).await,
        JobRequest::FlashEeprom { board } => flash_eeprom(&ctx, board).await,
        JobRequest::Program {
            bin,
            board,
            use_flash,
        } => program(&ctx, &bin, board, use_flash).await,
        JobRequest::Erase { board } => erase(&ctx, board).await,
    };

    ctx.reporter.progress();
    drop(guard);

    let report = JobReport {
        id,
        kind,
        outcome,
        started_at,
        finished_at: Utc::now(),
    };
    match &report.outcome {
        JobOutcome::Failed(e) => warn!(error = %e, "Job failed"),
        outcome => info!(
            outcome = %outcome,
            duration_ms = report.duration().as_millis() as u64,
            "Job finished"
        ),
    }

    ctx.reporter.finished(report);
}

async fn enumerate(ctx: &JobContext) -> JobOutcome {
    match ctx.catalog.refresh(&ctx.cancel).await {
        Ok(refresh) => JobOutcome::Completed {
            exit_code: refresh.exit_code,
        },
        Err(e) => ctx.abandon(e),
    }
}

async fn flash_eeprom(ctx: &JobContext, board: Board) -> JobOutcome {
    let command = commands::flash_eeprom(&ctx.tools, board);
    let exit_code = match ctx.execute(&command).await {
        Ok(code) => code,
        Err(outcome) => return outcome,
    };

    if exit_code != 0 {
        ctx.reporter.alert(Alert::error(EEPROM_FAILED));
        return JobOutcome::Failed(LoaderError::NonZeroExit {
            action: "EEPROM flash",
            code: exit_code,
        });
    }

    ctx.reporter.alert(Alert::info(EEPROM_REPLUG));
    JobOutcome::Completed { exit_code }
}

async fn program(ctx: &JobContext, bin: &Path, board: Board, use_flash: bool) -> JobOutcome {
    let index = match ctx.locate(board).await {
        Ok(index) => index,
        Err(outcome) => return outcome,
    };

    let command = commands::program(&ctx.tools, bin, board, use_flash, index);
    let exit_code = match ctx.execute(&command).await {
        Ok(code) => code,
        Err(outcome) => return outcome,
    };

    if exit_code != 0 {
        ctx.reporter.alert(Alert::error(PROGRAM_FAILED));
        return JobOutcome::Failed(LoaderError::NonZeroExit {
            action: "Programming",
            code: exit_code,
        });
    }

    ctx.reporter.status().set(DONE);
    JobOutcome::Completed { exit_code }
}

async fn erase(ctx: &JobContext, board: Board) -> JobOutcome {
    let index = match ctx.locate(board).await {
        Ok(index) => index,
        Err(outcome) => return outcome,
    };

    let command = commands::erase(&ctx.tools, board, index);
    let exit_code = match ctx.execute(&command).await {
        Ok(code) => code,
        Err(outcome) => return outcome,
    };

    if exit_code != 0 {
        ctx.reporter.alert(Alert::error(ERASE_FAILED));
        return JobOutcome::Failed(LoaderError::NonZeroExit {
            action: "Erase",
            code: exit_code,
        });
    }

    ctx.reporter.status().set(DONE);
    JobOutcome::Completed { exit_code }
}

impl JobContext {
    /// Look up the board's device index with a fresh listing.
    async fn locate(&self, board: Board) -> Result<usize, JobOutcome> {
        self.reporter.update(LOOKING_FOR_DEVICE);

        match self
            .catalog
            .resolve_index(board.description(), &self.cancel)
            .await
        {
            Ok(Some(index)) => {
                info!(board = %board, index, "Found device");
                Ok(index)
            }
            Ok(None) => {
                self.reporter.alert(Alert::error(DEVICE_NOT_FOUND));
                Err(JobOutcome::Failed(LoaderError::DeviceNotFound {
                    description: board.description().to_string(),
                }))
            }
            Err(e) => Err(self.abandon(e)),
        }
    }

    /// Run `command` with both output streams relayed into the status and
    /// return its exit code.
    async fn execute(&self, command: &CommandLine) -> Result<i32, JobOutcome> {
        let mut process = process::spawn(command).map_err(|e| self.abandon(e))?;

        let relays = RelayPair::attach(&mut process, &self.reporter);
        let result = process.wait(&self.cancel).await;
        relays.join().await;

        result.map_err(|e| self.abandon(e))
    }

    /// Turn an error that ends the job into its outcome, reporting it on the way.
    fn abandon(&self, e: LoaderError) -> JobOutcome {
        if e.is_interrupted() {
            self.reporter.status().set(INTERRUPTED);
            return JobOutcome::Cancelled;
        }

        if matches!(e, LoaderError::Launch { .. }) {
            self.reporter.status().set(LAUNCH_FAILED);
        }
        self.reporter.alert(Alert::error(e.to_string()));
        JobOutcome::Failed(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_finished(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> (usize, JobReport) {
        let mut progress = 0;
        loop {
            let event = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timeout waiting for job")
                .expect("channel closed");
            match event {
                JobEvent::Progress => progress += 1,
                JobEvent::Alert(_) => {}
                JobEvent::Finished(report) => return (progress, report),
            }
        }
    }

    #[tokio::test]
    async fn stop_when_idle_does_nothing() {
        let (runner, _rx) = JobRunner::new(ToolPaths::from_dir("/nonexistent/tools"));
        assert!(!runner.stop());
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    #[tokio::test]
    async fn launch_failure_still_finishes() {
        let (runner, mut rx) = JobRunner::new(ToolPaths::from_dir("/nonexistent/tools"));
        let id = runner.start_flash_eeprom(Board::Cu).unwrap();
        assert_eq!(
            runner.state(),
            RunnerState::Running {
                id,
                kind: JobKind::FlashEeprom
            }
        );

        let (progress, report) = next_finished(&mut rx).await;
        assert!(progress >= 1);
        assert_eq!(report.id, id);
        assert!(matches!(
            report.outcome,
            JobOutcome::Failed(LoaderError::Launch { .. })
        ));
        assert_eq!(runner.status(), LAUNCH_FAILED);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn runner_is_idle_before_finished_is_seen() {
        let (runner, mut rx) = JobRunner::new(ToolPaths::from_dir("/nonexistent/tools"));
        runner.start_enumerate().unwrap();

        let (_, report) = next_finished(&mut rx).await;
        assert_eq!(report.kind, JobKind::Enumerate);
        assert_eq!(runner.state(), RunnerState::Idle);
        assert!(runner.devices().is_empty());

        runner.join().await;
        assert!(runner.start_enumerate().is_ok());
    }
}
