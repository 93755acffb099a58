//! Encoder diagnostic output monitoring.
//!
//! Each of the encoder's output pipes is drained line by line. Lines are
//! logged with their stream label; lines that look like a lost camera
//! connection are additionally recorded as high-severity events. Reading
//! never stops because of a match.

use crate::models::{EventType, NewEvent, Severity};
use crate::storage::Storage;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Substrings (lowercase) marking a connectivity failure in encoder output.
pub const CONNECTIVITY_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timed out",
    "timeout",
    "no route to host",
    "network is unreachable",
    "host is unreachable",
];

/// Which diagnostic pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLabel {
    Stdout,
    Stderr,
}

impl StreamLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamLabel::Stdout => "stdout",
            StreamLabel::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an encoder output line reports a connectivity failure.
pub fn is_connectivity_failure(line: &str) -> bool {
    let line = line.to_lowercase();
    CONNECTIVITY_PATTERNS.iter().any(|p| line.contains(p))
}

/// Counters collected while monitoring one stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSummary {
    pub lines: u64,
    pub connectivity_failures: u64,
}

/// Drains one encoder output stream.
pub struct OutputMonitor {
    label: StreamLabel,
    storage: Arc<dyn Storage>,
}

impl OutputMonitor {
    pub fn new(label: StreamLabel, storage: Arc<dyn Storage>) -> Self {
        Self { label, storage }
    }

    /// Read until the stream closes or `token` is cancelled.
    pub async fn run<R>(self, reader: R, token: CancellationToken) -> MonitorSummary
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        let mut summary = MonitorSummary::default();

        loop {
            buf.clear();

            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }

                    summary.lines += 1;
                    debug!(stream = %self.label, line = %line, "Encoder output");

                    if is_connectivity_failure(line) {
                        summary.connectivity_failures += 1;
                        self.report(line).await;
                    }
                }
                Err(e) => {
                    warn!(stream = %self.label, error = %e, "Error reading encoder output");
                    break;
                }
            }
        }

        debug!(
            stream = %self.label,
            lines = summary.lines,
            failures = summary.connectivity_failures,
            "Encoder output monitor finished"
        );
        summary
    }

    async fn report(&self, line: &str) {
        warn!(stream = %self.label, line = %line, "Camera connectivity failure");

        let event = NewEvent::new(
            EventType::CameraError,
            Severity::High,
            "Camera Connection Error",
            format!("Encoder error: {}", line),
        )
        .with_metadata(json!({ "stream": self.label.as_str(), "line": line }));

        if let Err(e) = self.storage.create_event(event).await {
            warn!(error = %e, "Could not record camera error event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, NullStore};
    use std::time::Duration;

    #[test]
    fn test_connectivity_classification() {
        assert!(is_connectivity_failure(
            "[tcp @ 0x55d] Connection to tcp://10.0.0.5:554 failed: Connection refused"
        ));
        assert!(is_connectivity_failure("rtsp://cam/live: Connection timed out"));
        assert!(is_connectivity_failure("No route to host"));
        assert!(is_connectivity_failure("Network is unreachable"));
        assert!(!is_connectivity_failure(
            "frame=  120 fps= 25 q=-1.0 size=N/A time=00:00:04.80 bitrate=N/A speed=1x"
        ));
        assert!(!is_connectivity_failure("Stream #0:0: Video: h264"));
    }

    #[tokio::test]
    async fn test_monitor_records_events_and_keeps_reading() {
        let storage = Arc::new(MemoryStore::new());
        let output: &[u8] = b"Input #0, rtsp, from 'rtsp://cam/live':\n\
            Connection refused\n\
            Stream #0:0: Video: h264\n\
            Operation timed out\n";

        let monitor = OutputMonitor::new(StreamLabel::Stderr, storage.clone());
        let summary = monitor.run(output, CancellationToken::new()).await;

        assert_eq!(summary.lines, 4);
        assert_eq!(summary.connectivity_failures, 2);

        let events = storage.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == EventType::CameraError));
        assert!(events.iter().all(|e| e.severity == Severity::High));
        assert_eq!(events[0].message, "Encoder error: Connection refused");
    }

    #[tokio::test]
    async fn test_monitor_survives_storage_failure() {
        let output: &[u8] = b"Connection refused\nmore output\n";
        let monitor = OutputMonitor::new(StreamLabel::Stderr, Arc::new(NullStore));
        let summary = monitor.run(output, CancellationToken::new()).await;
        assert_eq!(summary.lines, 2);
        assert_eq!(summary.connectivity_failures, 1);
    }

    #[tokio::test]
    async fn test_monitor_handles_invalid_utf8() {
        let output: &[u8] = b"bad \xff\xfe bytes\nConnection refused\n";
        let storage = Arc::new(MemoryStore::new());
        let monitor = OutputMonitor::new(StreamLabel::Stdout, storage.clone());
        let summary = monitor.run(output, CancellationToken::new()).await;
        assert_eq!(summary.lines, 2);
        assert_eq!(storage.events().len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancellation() {
        // The writer half stays open so the stream never reaches EOF
        let (_writer, reader) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let monitor = OutputMonitor::new(StreamLabel::Stdout, Arc::new(MemoryStore::new()));

        let task = tokio::spawn(monitor.run(reader, token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("monitor did not stop")
            .unwrap();
        assert_eq!(summary.lines, 0);
    }
}
