//! Shared status line and event fan-out for the running job.
//!
//! The status is a single latest-value string: every update overwrites the
//! previous one and is followed by a [`JobEvent::Progress`] so no change goes
//! unnoticed by the front end. Readers never observe a half-written value
//! because every access goes through the lock.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use super::models::{Alert, JobEvent, JobReport};

/// Thread-safe latest-value status cell.
#[derive(Clone, Default)]
pub struct StatusCell {
    inner: Arc<RwLock<String>>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, line: impl Into<String>) {
        let mut status = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *status = line.into();
    }

    pub fn get(&self) -> String {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle used by job bodies and relays to publish status and events.
#[derive(Clone)]
pub struct StatusReporter {
    status: StatusCell,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl StatusReporter {
    pub fn new(status: StatusCell, events: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self { status, events }
    }

    pub fn status(&self) -> &StatusCell {
        &self.status
    }

    /// Overwrite the status and notify the front end.
    pub fn update(&self, line: impl Into<String>) {
        self.status.set(line);
        self.progress();
    }

    pub fn progress(&self) {
        // A closed receiver means nobody is listening any more.
        let _ = self.events.send(JobEvent::Progress);
    }

    pub fn alert(&self, alert: Alert) {
        let _ = self.events.send(JobEvent::Alert(alert));
    }

    pub fn finished(&self, report: JobReport) {
        let _ = self.events.send(JobEvent::Finished(report));
    }
}
