//! Recording lifecycle.
//!
//! One recording is registered per pipeline session. The encoder writes a
//! series of timestamped segments, so when the registered path itself cannot
//! be measured the session's segments are summed instead.

use crate::encoder::is_session_segment;
use crate::models::{FinishedRecording, Recording};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The session's open recording.
#[derive(Debug, Clone)]
pub struct RecordingRef {
    pub id: i64,
    pub file_path: PathBuf,
    pub start_time: DateTime<Utc>,
}

impl From<Recording> for RecordingRef {
    fn from(recording: Recording) -> Self {
        Self {
            id: recording.id,
            file_path: recording.file_path,
            start_time: recording.start_time,
        }
    }
}

/// Opens and closes the session recording through storage.
pub struct RecordingLifecycle {
    storage: Arc<dyn Storage>,
    session: String,
}

impl RecordingLifecycle {
    pub fn new(storage: Arc<dyn Storage>, session: impl Into<String>) -> Self {
        Self {
            storage,
            session: session.into(),
        }
    }

    /// Register a recording. `None` when storage is unavailable; capture
    /// continues without one.
    pub async fn open(&self, file_path: &Path) -> Option<RecordingRef> {
        match self.storage.start_recording(file_path).await {
            Ok(recording) => {
                info!(
                    recording_id = recording.id,
                    path = %file_path.display(),
                    "Recording started"
                );
                Some(recording.into())
            }
            Err(e) => {
                warn!(
                    path = %file_path.display(),
                    error = %e,
                    "Could not register recording, continuing without one"
                );
                None
            }
        }
    }

    /// Measure and complete the recording. Never fails; the returned values
    /// are what was (or would have been) stored.
    pub async fn close(&self, recording: RecordingRef, file_path: &Path) -> FinishedRecording {
        let end_time = Utc::now();
        let duration_secs = (end_time - recording.start_time).num_seconds().max(0);
        let size_bytes = measure_recording(file_path, &self.session).await;

        let finished = FinishedRecording {
            file_path: file_path.to_path_buf(),
            end_time,
            duration_secs,
            size_bytes,
        };

        match self
            .storage
            .finish_recording(recording.id, finished.clone())
            .await
        {
            Ok(()) => info!(
                recording_id = recording.id,
                duration_secs = duration_secs,
                size_bytes = size_bytes,
                "Recording finished"
            ),
            Err(e) => warn!(
                recording_id = recording.id,
                error = %e,
                "Could not finalize recording"
            ),
        }

        finished
    }
}

/// Size of the recording at `path`, or of the session's segments beside it.
///
/// Returns 0 with a warning if neither can be measured.
pub async fn measure_recording(path: &Path, session: &str) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) => return meta.len(),
        Err(e) => debug!(path = %path.display(), error = %e, "Recording file not found"),
    }

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    match segments_size(dir, session).await {
        Ok((count, total)) if count > 0 => {
            debug!(segments = count, size_bytes = total, "Measured session segments");
            total
        }
        Ok(_) => {
            warn!(path = %path.display(), "Could not stat recording, recording size as 0");
            0
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Could not stat recording, recording size as 0"
            );
            0
        }
    }
}

async fn segments_size(dir: &Path, session: &str) -> std::io::Result<(usize, u64)> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut count = 0;
    let mut total = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_session_segment(&path, session) {
            continue;
        }
        if let Ok(meta) = entry.metadata().await {
            count += 1;
            total += meta.len();
        }
    }

    Ok((count, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordingStatus;
    use crate::storage::{MemoryStore, NullStore};

    #[tokio::test]
    async fn test_open_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording_s1.mp4");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let storage = Arc::new(MemoryStore::new());
        let lifecycle = RecordingLifecycle::new(storage.clone(), "s1");

        let recording = lifecycle.open(&path).await.unwrap();
        assert_eq!(storage.recordings()[0].status, RecordingStatus::Recording);

        let finished = lifecycle.close(recording, &path).await;
        assert_eq!(finished.size_bytes, 2048);

        let stored = &storage.recordings()[0];
        assert_eq!(stored.status, RecordingStatus::Completed);
        assert_eq!(stored.size_bytes, 2048);

        let end = stored.end_time.unwrap();
        assert_eq!(stored.duration_secs, (end - stored.start_time).num_seconds());
    }

    #[tokio::test]
    async fn test_duration_is_wall_clock() {
        let storage = Arc::new(MemoryStore::new());
        let lifecycle = RecordingLifecycle::new(storage.clone(), "s1");
        let path = Path::new("/nonexistent/recording_s1.mp4");

        let mut recording = lifecycle.open(path).await.unwrap();
        recording.start_time = recording.start_time - chrono::Duration::seconds(90);

        let finished = lifecycle.close(recording, path).await;
        assert_eq!(finished.duration_secs, 90);
    }

    #[tokio::test]
    async fn test_stat_failure_records_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording_s1.mp4");

        let storage = Arc::new(MemoryStore::new());
        let lifecycle = RecordingLifecycle::new(storage.clone(), "s1");
        let recording = lifecycle.open(&path).await.unwrap();

        let finished = lifecycle.close(recording, &path).await;
        assert_eq!(finished.size_bytes, 0);
        assert_eq!(storage.recordings()[0].status, RecordingStatus::Completed);
    }

    #[tokio::test]
    async fn test_segments_are_summed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("recording_s1_20240101_120000.mp4"), [0u8; 100]).unwrap();
        std::fs::write(dir.path().join("recording_s1_20240101_120100.mp4"), [0u8; 50]).unwrap();
        std::fs::write(dir.path().join("recording_s2_20240101_120000.mp4"), [0u8; 999]).unwrap();
        std::fs::write(dir.path().join("frame_s1_20240101_120000.jpg"), [0u8; 7]).unwrap();

        let size = measure_recording(&dir.path().join("recording_s1.mp4"), "s1").await;
        assert_eq!(size, 150);
    }

    #[tokio::test]
    async fn test_missing_directory_records_zero() {
        let size = measure_recording(Path::new("/nonexistent/dir/recording_s1.mp4"), "s1").await;
        assert_eq!(size, 0);
    }

    #[tokio::test]
    async fn test_open_without_storage() {
        let lifecycle = RecordingLifecycle::new(Arc::new(NullStore), "s1");
        assert!(lifecycle.open(Path::new("/tmp/recording_s1.mp4")).await.is_none());
    }
}
