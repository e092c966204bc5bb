//! Relays that drain loader output into the shared status line.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use super::process::ToolProcess;
use super::status::StatusReporter;

/// How long to wait for output to hit end-of-stream after its process ended.
pub(crate) const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawn a task that publishes every line of `stream` as the status.
///
/// A line ends at `\n`, `\r` or `\r\n`, so carriage-return progress updates
/// each become their own status. The task ends quietly on end-of-stream or on
/// a read error; the stream is dropped with the task on every path.
pub fn spawn_relay<R>(name: &'static str, stream: R, reporter: StatusReporter) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut splitter = LineSplitter::default();
        let mut publish = |line: String| {
            debug!(stream = name, line = %line, "Loader output");
            reporter.update(line);
        };

        loop {
            let chunk = match reader.fill_buf().await {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(stream = name, error = %e, "Relay read failed");
                    break;
                }
            };
            if chunk.is_empty() {
                if let Some(line) = splitter.finish() {
                    publish(line);
                }
                break;
            }

            let len = chunk.len();
            splitter.push(chunk, &mut publish);
            reader.consume(len);
        }
    })
}

/// Splits a byte stream into lines terminated by `\n`, `\r` or `\r\n`.
#[derive(Debug, Default)]
struct LineSplitter {
    line: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8], mut emit: impl FnMut(String)) {
        for &byte in bytes {
            match byte {
                // Second half of a CRLF pair, already emitted at the CR.
                b'\n' if self.after_cr => self.after_cr = false,
                b'\r' | b'\n' => {
                    emit(String::from_utf8_lossy(&self.line).into_owned());
                    self.line.clear();
                    self.after_cr = byte == b'\r';
                }
                _ => {
                    self.after_cr = false;
                    self.line.push(byte);
                }
            }
        }
    }

    /// The unterminated tail, if any.
    fn finish(&mut self) -> Option<String> {
        if self.line.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        Some(line)
    }
}

/// The stdout and stderr relays attached to one process.
pub struct RelayPair {
    handles: Vec<JoinHandle<()>>,
}

impl RelayPair {
    pub fn attach(process: &mut ToolProcess, reporter: &StatusReporter) -> Self {
        let mut handles = Vec::with_capacity(2);
        if let Some(stderr) = process.take_stderr() {
            handles.push(spawn_relay("stderr", stderr, reporter.clone()));
        }
        if let Some(stdout) = process.take_stdout() {
            handles.push(spawn_relay("stdout", stdout, reporter.clone()));
        }
        Self { handles }
    }

    /// Wait for both relays to finish under one shared drain deadline. A relay
    /// still blocked at the deadline (a grandchild holding the pipe open) is
    /// aborted, and has stopped publishing by the time this returns.
    pub async fn join(self) {
        let deadline = Instant::now() + RELAY_DRAIN_TIMEOUT;
        for mut handle in self.handles {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Relay did not reach end of stream, aborting it");
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::JobEvent;
    use crate::core::status::StatusCell;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn relays_every_line_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let status = StatusCell::new();
        let reporter = StatusReporter::new(status.clone(), tx);

        let input: &'static [u8] = b"Erasing...\r\nWriting 50%\nWriting 100%";
        spawn_relay("stdout", input, reporter).await.unwrap();

        let mut progress = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, JobEvent::Progress));
            progress += 1;
        }
        assert_eq!(progress, 3);
        assert_eq!(status.get(), "Writing 100%");
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_relay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let status = StatusCell::new();
        let reporter = StatusReporter::new(status.clone(), tx);

        let input: &'static [u8] = b"bad \xff byte\nlast line\n";
        spawn_relay("stderr", input, reporter).await.unwrap();

        assert!(matches!(rx.try_recv(), Ok(JobEvent::Progress)));
        assert!(matches!(rx.try_recv(), Ok(JobEvent::Progress)));
        assert!(rx.try_recv().is_err());
        assert_eq!(status.get(), "last line");
    }

    #[tokio::test]
    async fn empty_stream_publishes_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let status = StatusCell::new();
        status.set("Starting...");
        let reporter = StatusReporter::new(status.clone(), tx);

        let input: &'static [u8] = b"";
        spawn_relay("stdout", input, reporter).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(status.get(), "Starting...");
    }

    #[tokio::test]
    async fn carriage_returns_split_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let status = StatusCell::new();
        let reporter = StatusReporter::new(status.clone(), tx);

        let input: &'static [u8] = b"a\rb\r\nc\n";
        spawn_relay("stdout", input, reporter).await.unwrap();

        let mut progress = 0;
        while rx.try_recv().is_ok() {
            progress += 1;
        }
        assert_eq!(progress, 3);
        assert_eq!(status.get(), "c");
    }

    #[test]
    fn splitter_handles_crlf_across_chunks() {
        let mut splitter = LineSplitter::default();
        let mut lines = Vec::new();

        splitter.push(b"Erasing 10%\rErasing 50%\r", |l| lines.push(l));
        splitter.push(b"\nDevices:\r\n\nte", |l| lines.push(l));
        splitter.push(b"il", |l| lines.push(l));

        assert_eq!(lines, vec!["Erasing 10%", "Erasing 50%", "Devices:", ""]);
        assert_eq!(splitter.finish().as_deref(), Some("til"));
        assert_eq!(splitter.finish(), None);
    }

    #[tokio::test]
    async fn join_shares_one_deadline_and_silences_aborted_relays() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let status = StatusCell::new();
        let reporter = StatusReporter::new(status.clone(), tx);

        // Writers stay open, so neither relay reaches end-of-stream.
        let (mut out_writer, out_reader) = tokio::io::duplex(64);
        let (_err_writer, err_reader) = tokio::io::duplex(64);
        out_writer.write_all(b"Writing 100%\n").await.unwrap();

        let pair = RelayPair {
            handles: vec![
                spawn_relay("stderr", err_reader, reporter.clone()),
                spawn_relay("stdout", out_reader, reporter),
            ],
        };

        let started = std::time::Instant::now();
        pair.join().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= RELAY_DRAIN_TIMEOUT);
        assert!(elapsed < RELAY_DRAIN_TIMEOUT + Duration::from_secs(1));

        assert_eq!(status.get(), "Writing 100%");
        status.set("Done.");
        let _ = out_writer.write_all(b"late line\n").await;
        tokio::task::yield_now().await;
        assert_eq!(status.get(), "Done.");

        assert!(matches!(rx.try_recv(), Ok(JobEvent::Progress)));
        assert!(rx.try_recv().is_err());
    }
}
