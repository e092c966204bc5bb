//! Stub `loader` executable and event helpers shared by the integration tests.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alchitry_loader::config::ToolPaths;
use alchitry_loader::core::{Alert, JobEvent, JobReport};
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// The stub records every invocation as one `|`-joined line, answers `-l`
/// from `list_output`/`list_exit` and runs `job_body` for anything else.
/// With `list_linger` present, `-l` leaves a background process holding its
/// output pipes open after it exits.
const STUB_SCRIPT: &str = r#"#!/bin/sh
DIR="$(cd "$(dirname "$0")" && pwd)"
(IFS='|'; printf '%s\n' "$*") >> "$DIR/invocations.log"
if [ "$1" = "-l" ]; then
  if [ "$(cat "$DIR/list_exit")" = "block" ]; then
    exec sleep 30
  fi
  if [ -f "$DIR/list_linger" ]; then
    (sleep 20 &)
  fi
  cat "$DIR/list_output"
  exit "$(cat "$DIR/list_exit")"
fi
"#;

pub const TWO_BOARDS: &str = "Devices:\n0:Alchitry Au\n1:Alchitry Cu\n";

pub struct StubLoader {
    dir: TempDir,
    pub tools: ToolPaths,
}

impl StubLoader {
    pub fn new(list_output: &str, job_body: &str) -> Self {
        let dir = tempdir().unwrap();
        let tools = ToolPaths::from_dir(dir.path());

        std::fs::write(&tools.loader, format!("{STUB_SCRIPT}{job_body}\n")).unwrap();
        let mut perms = std::fs::metadata(&tools.loader).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&tools.loader, perms).unwrap();

        let stub = Self { dir, tools };
        stub.set_listing(list_output, "0");
        stub
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Change what `loader -l` prints and how it exits. `"block"` makes it hang.
    pub fn set_listing(&self, output: &str, exit: &str) {
        std::fs::write(self.path().join("list_output"), output).unwrap();
        std::fs::write(self.path().join("list_exit"), exit).unwrap();
    }

    /// Make `loader -l` leave a grandchild holding its pipes open.
    pub fn linger_listing(&self) {
        std::fs::write(self.path().join("list_linger"), "").unwrap();
    }

    /// Argument lists of every invocation so far, `|`-joined.
    pub fn invocations(&self) -> Vec<String> {
        match std::fs::read_to_string(self.path().join("invocations.log")) {
            Ok(log) => log.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }

    /// Wait for the job body to write `name`, returning its trimmed contents.
    pub async fn wait_for_file(&self, name: &str) -> String {
        let path = self.file(name);
        timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(contents) = std::fs::read_to_string(&path) {
                    if !contents.trim().is_empty() {
                        return contents.trim().to_string();
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timeout waiting for stub output file")
    }
}

/// Events observed for one job, up to and including `Finished`.
pub struct JobTrace {
    pub progress: usize,
    pub alerts: Vec<Alert>,
    pub report: JobReport,
    pub finished_after_progress: bool,
}

pub async fn trace_job(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> JobTrace {
    let mut progress = 0;
    let mut alerts = Vec::new();

    loop {
        let event = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timeout waiting for job event")
            .expect("channel closed");

        match event {
            JobEvent::Progress => progress += 1,
            JobEvent::Alert(alert) => alerts.push(alert),
            JobEvent::Finished(report) => {
                return JobTrace {
                    finished_after_progress: progress > 0,
                    progress,
                    alerts,
                    report,
                };
            }
        }
    }
}

/// True when no further events are queued.
pub fn drained(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> bool {
    rx.try_recv().is_err()
}

/// Whether a process with this pid still exists.
pub fn process_alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
