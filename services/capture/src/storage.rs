//! Storage collaborator used by the pipeline.
//!
//! The pipeline treats every storage call as best-effort: a failure is
//! logged and the operation skipped, capture carries on. Implementations
//! must be safe for concurrent use since diagnostic events, detection
//! events and lifecycle calls race each other.

use crate::models::{
    CameraStatus, Event, FinishedRecording, Frame, NewEvent, Recording, RecordingStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors returned by storage implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Recording not found: {0}")]
    RecordingNotFound(i64),

    #[error("Frame not found: {0}")]
    FrameNotFound(i64),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence operations consumed by the capture pipeline.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create a recording in the `recording` state.
    async fn start_recording(&self, file_path: &Path) -> StorageResult<Recording>;

    /// Store final measurements and mark the recording completed.
    async fn finish_recording(
        &self,
        recording_id: i64,
        finished: FinishedRecording,
    ) -> StorageResult<()>;

    /// Register a newly extracted frame.
    async fn save_frame(
        &self,
        file_path: &Path,
        recording_id: Option<i64>,
    ) -> StorageResult<Frame>;

    /// Mark a frame processed. `processed` never reverts to false.
    async fn update_frame_processed(
        &self,
        frame_id: i64,
        has_detection: bool,
        thumbnail_path: Option<String>,
    ) -> StorageResult<()>;

    async fn create_event(&self, event: NewEvent) -> StorageResult<()>;

    async fn update_camera_status(&self, status: CameraStatus) -> StorageResult<()>;
}

/// Entries kept per collection by [`MemoryStore::new`].
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Default)]
struct MemoryState {
    recordings: VecDeque<Recording>,
    frames: VecDeque<Frame>,
    events: VecDeque<Event>,
    camera_status: Option<CameraStatus>,
    next_recording_id: i64,
    next_frame_id: i64,
    next_event_id: i64,
}

/// Push to the back, dropping the oldest entries beyond `limit`.
fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, limit: usize) {
    queue.push_back(item);
    while queue.len() > limit {
        queue.pop_front();
    }
}

/// Counts of everything ever stored, including evicted entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreTotals {
    pub recordings: u64,
    pub frames: u64,
    pub events: u64,
}

/// Thread-safe in-memory storage.
///
/// Keeps the most recent `history_limit` recordings, frames and events.
/// Ids keep increasing across evictions; updating an evicted entry reports
/// it as not found.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    history_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            history_limit: history_limit.max(1),
        }
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub fn totals(&self) -> StoreTotals {
        let state = self.state.lock();
        StoreTotals {
            recordings: state.next_recording_id as u64,
            frames: state.next_frame_id as u64,
            events: state.next_event_id as u64,
        }
    }

    pub fn recordings(&self) -> Vec<Recording> {
        self.state.lock().recordings.iter().cloned().collect()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.state.lock().frames.iter().cloned().collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.iter().cloned().collect()
    }

    pub fn camera_status(&self) -> Option<CameraStatus> {
        self.state.lock().camera_status
    }

    /// Frame registered for the given path, if any.
    pub fn frame_by_path(&self, path: &Path) -> Option<Frame> {
        self.state
            .lock()
            .frames
            .iter()
            .find(|f| f.file_path == path)
            .cloned()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn start_recording(&self, file_path: &Path) -> StorageResult<Recording> {
        let mut state = self.state.lock();
        state.next_recording_id += 1;

        let recording = Recording {
            id: state.next_recording_id,
            file_path: file_path.to_path_buf(),
            start_time: Utc::now(),
            end_time: None,
            duration_secs: 0,
            size_bytes: 0,
            status: RecordingStatus::Recording,
        };
        push_bounded(&mut state.recordings, recording.clone(), self.history_limit);

        debug!(recording_id = recording.id, path = %file_path.display(), "Recording stored");
        Ok(recording)
    }

    async fn finish_recording(
        &self,
        recording_id: i64,
        finished: FinishedRecording,
    ) -> StorageResult<()> {
        let mut state = self.state.lock();
        let recording = state
            .recordings
            .iter_mut()
            .find(|r| r.id == recording_id)
            .ok_or(StorageError::RecordingNotFound(recording_id))?;

        recording.file_path = finished.file_path;
        recording.end_time = Some(finished.end_time);
        recording.duration_secs = finished.duration_secs;
        recording.size_bytes = finished.size_bytes;
        recording.status = RecordingStatus::Completed;
        Ok(())
    }

    async fn save_frame(
        &self,
        file_path: &Path,
        recording_id: Option<i64>,
    ) -> StorageResult<Frame> {
        let mut state = self.state.lock();
        state.next_frame_id += 1;

        let frame = Frame {
            id: state.next_frame_id,
            recording_id,
            file_path: PathBuf::from(file_path),
            timestamp: Utc::now(),
            thumbnail_path: None,
            processed: false,
            has_detection: false,
        };
        push_bounded(&mut state.frames, frame.clone(), self.history_limit);
        Ok(frame)
    }

    async fn update_frame_processed(
        &self,
        frame_id: i64,
        has_detection: bool,
        thumbnail_path: Option<String>,
    ) -> StorageResult<()> {
        let mut state = self.state.lock();
        let frame = state
            .frames
            .iter_mut()
            .find(|f| f.id == frame_id)
            .ok_or(StorageError::FrameNotFound(frame_id))?;

        frame.processed = true;
        frame.has_detection = has_detection;
        frame.thumbnail_path = thumbnail_path;
        Ok(())
    }

    async fn create_event(&self, event: NewEvent) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.next_event_id += 1;

        let event = Event {
            id: state.next_event_id,
            event_type: event.event_type,
            severity: event.severity,
            title: event.title,
            message: event.message,
            metadata: event.metadata,
            timestamp: Utc::now(),
        };
        push_bounded(&mut state.events, event, self.history_limit);
        Ok(())
    }

    async fn update_camera_status(&self, status: CameraStatus) -> StorageResult<()> {
        self.state.lock().camera_status = Some(status);
        Ok(())
    }
}

/// Storage that is never reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

fn unavailable<T>() -> StorageResult<T> {
    Err(StorageError::Unavailable("no storage backend configured".to_string()))
}

#[async_trait]
impl Storage for NullStore {
    async fn start_recording(&self, _file_path: &Path) -> StorageResult<Recording> {
        unavailable()
    }

    async fn finish_recording(&self, _id: i64, _finished: FinishedRecording) -> StorageResult<()> {
        unavailable()
    }

    async fn save_frame(&self, _path: &Path, _recording_id: Option<i64>) -> StorageResult<Frame> {
        unavailable()
    }

    async fn update_frame_processed(
        &self,
        _frame_id: i64,
        _has_detection: bool,
        _thumbnail_path: Option<String>,
    ) -> StorageResult<()> {
        unavailable()
    }

    async fn create_event(&self, _event: NewEvent) -> StorageResult<()> {
        unavailable()
    }

    async fn update_camera_status(&self, _status: CameraStatus) -> StorageResult<()> {
        unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, Severity};

    #[tokio::test]
    async fn test_recording_lifecycle() {
        let store = MemoryStore::new();
        let recording = store
            .start_recording(Path::new("/tmp/recording_1.mp4"))
            .await
            .unwrap();
        assert_eq!(recording.status, RecordingStatus::Recording);

        let finished = FinishedRecording {
            file_path: recording.file_path.clone(),
            end_time: Utc::now(),
            duration_secs: 42,
            size_bytes: 1024,
        };
        store.finish_recording(recording.id, finished).await.unwrap();

        let stored = &store.recordings()[0];
        assert_eq!(stored.status, RecordingStatus::Completed);
        assert_eq!(stored.duration_secs, 42);
        assert_eq!(stored.size_bytes, 1024);
        assert!(stored.end_time.is_some());
    }

    #[tokio::test]
    async fn test_finish_unknown_recording() {
        let store = MemoryStore::new();
        let finished = FinishedRecording {
            file_path: PathBuf::from("/tmp/x.mp4"),
            end_time: Utc::now(),
            duration_secs: 0,
            size_bytes: 0,
        };
        assert!(matches!(
            store.finish_recording(7, finished).await,
            Err(StorageError::RecordingNotFound(7))
        ));
    }

    #[tokio::test]
    async fn test_frame_processed() {
        let store = MemoryStore::new();
        let frame = store
            .save_frame(Path::new("/tmp/frame_1.jpg"), Some(3))
            .await
            .unwrap();
        assert!(!frame.processed);
        assert_eq!(frame.recording_id, Some(3));

        store.update_frame_processed(frame.id, true, None).await.unwrap();
        let stored = store.frame_by_path(Path::new("/tmp/frame_1.jpg")).unwrap();
        assert!(stored.processed);
        assert!(stored.has_detection);
    }

    #[tokio::test]
    async fn test_events_get_sequential_ids() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .create_event(NewEvent::new(EventType::SystemStart, Severity::Low, "t", "m"))
                .await
                .unwrap();
        }
        let ids: Vec<i64> = store.events().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_null_store_is_unavailable() {
        let store = NullStore;
        assert!(matches!(
            store.update_camera_status(CameraStatus::Active).await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(store.start_recording(Path::new("/tmp/r.mp4")).await.is_err());
    }

    #[tokio::test]
    async fn test_history_limit_evicts_oldest() {
        let store = MemoryStore::with_history_limit(3);

        for i in 0..10 {
            store
                .save_frame(&PathBuf::from(format!("/tmp/frame_{}.jpg", i)), None)
                .await
                .unwrap();
            store
                .create_event(NewEvent::new(EventType::SystemStart, Severity::Low, "t", "m"))
                .await
                .unwrap();
        }

        let frame_ids: Vec<i64> = store.frames().iter().map(|f| f.id).collect();
        assert_eq!(frame_ids, vec![8, 9, 10]);
        let event_ids: Vec<i64> = store.events().iter().map(|e| e.id).collect();
        assert_eq!(event_ids, vec![8, 9, 10]);

        assert_eq!(
            store.totals(),
            StoreTotals {
                recordings: 0,
                frames: 10,
                events: 10
            }
        );

        assert!(matches!(
            store.update_frame_processed(1, false, None).await,
            Err(StorageError::FrameNotFound(1))
        ));
        store.update_frame_processed(10, true, None).await.unwrap();
    }

    #[test]
    fn test_history_limit_floor() {
        assert_eq!(MemoryStore::with_history_limit(0).history_limit(), 1);
        assert_eq!(MemoryStore::new().history_limit(), DEFAULT_HISTORY_LIMIT);
    }
}
