//! Watches the encoder output directory for new frame images.

use crate::encoder::FRAME_PREFIX;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that can occur when setting up the watch.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to create file watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("Failed to watch {path}: {source}")]
    Register {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Whether `path` names a frame image written by the encoder.
///
/// Video segments, hidden files and anything without the frame prefix and
/// a JPEG extension are ignored.
pub fn is_frame_file(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };

    if name.starts_with('.') || !name.starts_with(FRAME_PREFIX) {
        return false;
    }

    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

/// A file appearing under its final name.
fn is_creation(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    )
}

/// Whether a raw watch event can matter to the frame stream: a frame
/// appearing in the directory, or the directory itself going away.
fn is_relevant(event: &Event, dir: &Path) -> bool {
    match event.kind {
        EventKind::Remove(_) => event.paths.iter().any(|p| p == dir),
        ref kind if is_creation(kind) => event.paths.iter().any(|p| is_frame_file(p)),
        _ => false,
    }
}

/// Streams paths of newly written frames.
pub struct FrameWatcher {
    dir: PathBuf,
    settle_delay: Duration,
    buffer: usize,
}

impl FrameWatcher {
    pub fn new(dir: impl Into<PathBuf>, settle_delay: Duration) -> Self {
        Self {
            dir: dir.into(),
            settle_delay,
            buffer: 64,
        }
    }

    /// Capacity of the raw event queue and of the returned stream.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Start watching.
    ///
    /// Registration failures are returned immediately. Once running, the
    /// returned receiver yields each frame path after the settle delay; it
    /// closes when `token` is cancelled or the watch fails.
    ///
    /// Events are filtered on the notify thread. When the consumer falls
    /// behind and the queue is full, further frames are dropped with a
    /// warning.
    pub fn spawn(
        self,
        token: CancellationToken,
    ) -> Result<(mpsc::Receiver<PathBuf>, JoinHandle<()>), WatchError> {
        let (raw_tx, raw_rx) = mpsc::channel(self.buffer);
        let dir = self.dir.clone();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| {
                if let Ok(event) = &res {
                    if !is_relevant(event, &dir) {
                        return;
                    }
                }

                match raw_tx.try_send(res) {
                    Ok(()) | Err(TrySendError::Closed(_)) => {}
                    Err(TrySendError::Full(Ok(event))) => {
                        warn!(paths = ?event.paths, "Frame queue full, dropping event");
                    }
                    Err(TrySendError::Full(Err(e))) => {
                        warn!(error = %e, "Frame queue full, dropping watcher error");
                    }
                }
            })
            .map_err(WatchError::Create)?;

        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Register {
                path: self.dir.clone(),
                source,
            })?;

        info!(dir = %self.dir.display(), "Watching for new frames");

        let (tx, rx) = mpsc::channel(self.buffer);
        let handle = tokio::spawn(self.run(watcher, raw_rx, tx, token));

        Ok((rx, handle))
    }

    async fn run(
        self,
        // Dropping the watcher unregisters it
        _watcher: RecommendedWatcher,
        mut raw_rx: mpsc::Receiver<notify::Result<Event>>,
        tx: mpsc::Sender<PathBuf>,
        token: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => break,
                received = raw_rx.recv() => received,
            };

            let event = match received {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    error!(dir = %self.dir.display(), error = %e, "File watcher error");
                    break;
                }
                None => break,
            };

            if matches!(event.kind, EventKind::Remove(_))
                && event.paths.iter().any(|p| p == &self.dir)
            {
                warn!(dir = %self.dir.display(), "Watched directory removed");
                break;
            }

            if !is_creation(&event.kind) {
                continue;
            }

            for path in event.paths.into_iter().filter(|p| is_frame_file(p)) {
                debug!(frame = %path.display(), "New frame detected");

                // Give the encoder time to finish flushing the file
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(self.settle_delay) => {}
                }

                if tx.send(path).await.is_err() {
                    debug!("Frame receiver dropped");
                    return;
                }
            }
        }

        info!(dir = %self.dir.display(), "Frame watcher stopped");
    }
}
