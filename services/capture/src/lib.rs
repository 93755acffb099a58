//! Camwatch Capture
//!
//! Capture-and-detection pipeline for a single RTSP camera. An external
//! ffmpeg process records the stream into fixed-length segments and samples
//! still frames into an output directory; each new frame is sent to the
//! detection service and qualifying detections are recorded as events.
//!
//! ## Components
//!
//! - **ProcessSupervisor**: spawns the encoder and guarantees it is gone on stop
//! - **OutputMonitor**: drains encoder output, flags camera connectivity failures
//! - **FrameWatcher**: streams newly written frame files
//! - **DetectionDispatcher**: calls the detection service with retry and backoff
//! - **RecordingLifecycle**: registers and finalizes the session recording
//! - **PipelineCoordinator**: start/stop state machine tying it all together
//!
//! Persistence goes through the [`Storage`] trait. Every storage call is
//! best-effort; capture never depends on it.
//!
//! # Example
//!
//! ```rust,no_run
//! use camwatch_capture::{CaptureConfig, MemoryStore, PipelineCoordinator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CaptureConfig::load()?;
//!     let mut pipeline = PipelineCoordinator::new(config, Arc::new(MemoryStore::new()));
//!
//!     pipeline.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     let stats = pipeline.stop().await?;
//!     println!("{} frames seen", stats.frames_seen);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod detection;
pub mod encoder;
pub mod models;
pub mod monitor;
pub mod pipeline;
pub mod recording;
pub mod storage;
pub mod watcher;

pub use config::{
    CameraConfig, CaptureConfig, ConfigValidationError, DetectionConfig, EncoderConfig,
    LoggingConfig, ShutdownConfig, StorageConfig,
};
pub use detection::{
    BoundingBox, Detection, DetectionBackend, DetectionDispatcher, DetectionError,
    DetectionRequest, DetectionResponse, DispatchOutcome, HttpDetectionClient, LinearBackoff,
    PathMapping, RetryPolicy,
};
pub use encoder::{
    EncoderError, EncoderHandle, ExitOutcome, ProcessSupervisor, SegmentParams, StreamUrl,
};
pub use models::{
    CameraStatus, Event, EventType, FinishedRecording, Frame, NewEvent, Recording,
    RecordingStatus, Severity,
};
pub use monitor::{OutputMonitor, StreamLabel};
pub use pipeline::{PipelineCoordinator, PipelineError, PipelineState, PipelineStats};
pub use recording::{RecordingLifecycle, RecordingRef};
pub use storage::{
    MemoryStore, NullStore, Storage, StorageError, StorageResult, StoreTotals,
    DEFAULT_HISTORY_LIMIT,
};
pub use watcher::{FrameWatcher, WatchError};
