//! Device enumeration through `loader -l`.
//!
//! The loader prints a header line starting with `Devices` followed by one
//! `<index>:<description>` line per attached board, in enumeration order.
//! That order defines the index later handed to `-b`.

use std::io;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands;
use super::process;
use super::relay::RELAY_DRAIN_TIMEOUT;
use crate::config::ToolPaths;
use crate::error::LoaderError;

const DEVICES_HEADER: &str = "Devices";

/// Result of a completed listing.
#[derive(Debug, Clone)]
pub struct Refresh {
    pub exit_code: i32,
    pub devices: Arc<[String]>,
}

/// Owns the most recent device list snapshot.
pub struct DeviceCatalog {
    tools: ToolPaths,
    snapshot: RwLock<Arc<[String]>>,
}

impl DeviceCatalog {
    pub fn new(tools: ToolPaths) -> Self {
        Self {
            tools,
            snapshot: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// The current snapshot. Never a partially written list.
    pub fn snapshot(&self) -> Arc<[String]> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, devices: Vec<String>) -> Arc<[String]> {
        let devices: Arc<[String]> = Arc::from(devices);
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *snapshot = devices.clone();
        devices
    }

    /// Run the loader in list mode and replace the snapshot with its output.
    ///
    /// A non-zero exit is the loader's way of saying "no devices" and yields
    /// an empty snapshot without an error. Launch failures, wait failures and
    /// cancellation clear the snapshot and return the error.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<Refresh, LoaderError> {
        let command = commands::list_devices(&self.tools);

        let mut process = match process::spawn(&command) {
            Ok(process) => process,
            Err(e) => {
                self.replace(Vec::new());
                return Err(e);
            }
        };

        // Drain both pipes while waiting so a chatty loader can't block on them.
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();
        let (chunks_tx, mut chunks) = mpsc::unbounded_channel::<io::Result<Vec<u8>>>();
        let collector = tokio::spawn(async move {
            let Some(mut stdout) = stdout else { return };
            loop {
                let mut chunk = Vec::with_capacity(1024);
                match stdout.read_buf(&mut chunk).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if chunks_tx.send(Ok(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = chunks_tx.send(Err(e));
                        break;
                    }
                }
            }
        });
        let discard = tokio::spawn(async move {
            if let Some(mut stderr) = stderr {
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
            }
        });

        let exit_code = match process.wait(cancel).await {
            Ok(code) => code,
            Err(e) => {
                collector.abort();
                discard.abort();
                self.replace(Vec::new());
                if e.is_interrupted() {
                    info!("Device listing interrupted");
                }
                return Err(e);
            }
        };

        if exit_code != 0 {
            collector.abort();
            discard.abort();
            debug!(exit_code, "Loader reported no devices");
            return Ok(Refresh {
                exit_code,
                devices: self.replace(Vec::new()),
            });
        }

        let collected = collect_output(&mut chunks, cancel).await;
        collector.abort();
        discard.abort();
        let output = match collected {
            Ok(output) => output,
            Err(e) => {
                self.replace(Vec::new());
                if e.is_interrupted() {
                    info!("Device listing interrupted");
                }
                return Err(e);
            }
        };

        let devices = parse_device_list(&String::from_utf8_lossy(&output));
        info!(count = devices.len(), "Device list refreshed");

        Ok(Refresh {
            exit_code,
            devices: self.replace(devices),
        })
    }

    /// Refresh, then return the position of the first device whose
    /// description equals `description` exactly.
    pub async fn resolve_index(
        &self,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, LoaderError> {
        let refresh = self.refresh(cancel).await?;
        let index = find_device(&refresh.devices, description);
        debug!(description, index = ?index, "Resolved device index");
        Ok(index)
    }
}

/// Gather listing output until end-of-stream, cancellation or the drain
/// deadline. At the deadline (something else still holds the pipe open) the
/// output received so far is used.
async fn collect_output(
    chunks: &mut mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, LoaderError> {
    let deadline = Instant::now() + RELAY_DRAIN_TIMEOUT;
    let mut output = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(LoaderError::Interrupted),
            chunk = timeout_at(deadline, chunks.recv()) => match chunk {
                Ok(Some(Ok(bytes))) => output.extend_from_slice(&bytes),
                Ok(Some(Err(e))) => return Err(LoaderError::Io(e)),
                Ok(None) => return Ok(output),
                Err(_) => {
                    warn!("Device listing output still open after the loader exited");
                    return Ok(output);
                }
            },
        }
    }
}

pub fn find_device(devices: &[String], description: &str) -> Option<usize> {
    devices.iter().position(|d| d == description)
}

/// Parse the output of `loader -l` into device descriptions.
///
/// A description is everything after the first colon, trimmed, so
/// descriptions may themselves contain colons.
pub fn parse_device_list(output: &str) -> Vec<String> {
    let mut lines = output.lines();

    match lines.next() {
        Some(header) if header.starts_with(DEVICES_HEADER) => {}
        _ => return Vec::new(),
    }

    lines
        .filter_map(|line| match line.split_once(':') {
            Some((_, description)) => Some(description.trim().to_string()),
            None => {
                warn!(line, "Ignoring malformed device line");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devices_in_order() {
        let devices = parse_device_list("Devices:\n0:Alchitry Au\n1:Alchitry Cu\n");
        assert_eq!(devices, vec!["Alchitry Au", "Alchitry Cu"]);
    }

    #[test]
    fn missing_header_means_no_devices() {
        assert!(parse_device_list("No devices found\n0:Alchitry Au\n").is_empty());
        assert!(parse_device_list("").is_empty());
    }

    #[test]
    fn header_only_is_empty() {
        assert!(parse_device_list("Devices:\n").is_empty());
    }

    #[test]
    fn trims_and_keeps_text_after_first_colon() {
        // "1:Board:Rev B" keeps "Board:Rev B", not just "Board".
        let devices = parse_device_list("Devices found: 2\r\n0: Alchitry Au \r\n1:Board:Rev B\n");
        assert_eq!(devices, vec!["Alchitry Au", "Board:Rev B"]);
    }

    #[test]
    fn skips_lines_without_colon() {
        let devices = parse_device_list("Devices:\ngarbage\n0:Alchitry Cu\n");
        assert_eq!(devices, vec!["Alchitry Cu"]);
    }

    #[test]
    fn find_device_first_match_wins() {
        let devices = vec![
            "Alchitry Cu".to_string(),
            "Alchitry Au".to_string(),
            "Alchitry Au".to_string(),
        ];
        assert_eq!(find_device(&devices, "Alchitry Au"), Some(1));
        assert_eq!(find_device(&devices, "Alchitry Cu"), Some(0));
        assert_eq!(find_device(&devices, "Nonexistent"), None);
        assert_eq!(find_device(&devices, "alchitry au"), None);
    }

    #[tokio::test]
    async fn launch_failure_clears_snapshot() {
        let catalog = DeviceCatalog::new(ToolPaths::from_dir("/nonexistent/tools"));
        catalog.replace(vec!["Alchitry Au".to_string()]);

        let result = catalog.refresh(&CancellationToken::new()).await;
        assert!(matches!(result, Err(LoaderError::Launch { .. })));
        assert!(catalog.snapshot().is_empty());
    }
}
