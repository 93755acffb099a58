//! Pipeline coordination.
//!
//! The coordinator owns the root cancellation token and every task derived
//! from it:
//!
//! ```text
//!              ┌──────────────┐  stdout/stderr  ┌───────────────┐
//! camera ────▶ │   encoder    │ ──────────────▶ │ OutputMonitor │ ──▶ events
//!              └──────────────┘                 └───────────────┘
//!                     │ segments + frames
//!                     ▼
//!              ┌──────────────┐   frame paths   ┌───────────────┐
//!              │ FrameWatcher │ ──────────────▶ │ frame handler │ ──▶ detection
//!              └──────────────┘                 └───────────────┘
//! ```
//!
//! Only failures before the pipeline is running are returned to the caller.
//! Everything afterwards degrades to logs and events.

use crate::config::CaptureConfig;
use crate::detection::{
    DetectionBackend, DetectionDispatcher, DetectionError, DispatchOutcome, HttpDetectionClient,
    PathMapping, RetryPolicy,
};
use crate::encoder::{
    EncoderError, EncoderHandle, ExitOutcome, ProcessSupervisor, SegmentParams, StreamUrl,
};
use crate::models::{CameraStatus, EventType, NewEvent, Severity};
use crate::monitor::{OutputMonitor, StreamLabel};
use crate::recording::{RecordingLifecycle, RecordingRef};
use crate::storage::Storage;
use crate::watcher::{FrameWatcher, WatchError};
use chrono::Utc;
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors returned by the coordinator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Cannot {operation} pipeline in state {state}")]
    InvalidState {
        operation: &'static str,
        state: PipelineState,
    },

    #[error("Failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Detection client error: {0}")]
    Detection(#[from] DetectionError),
}

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one pipeline session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_seen: u64,
    pub frames_dispatched: u64,
    pub detections: u64,
    pub detection_errors: u64,
    /// Connectivity failures reported by the encoder plus unexpected exits
    pub encoder_errors: u64,
}

/// Mutable session state shared with the frame path.
#[derive(Debug, Default)]
struct SessionState {
    sequence: u64,
    recording: Option<RecordingRef>,
    stats: PipelineStats,
}

type Session = Arc<Mutex<SessionState>>;

/// Handles one frame: save, dispatch, mark processed.
struct FrameHandler {
    storage: Arc<dyn Storage>,
    dispatcher: Option<DetectionDispatcher>,
    session: Session,
}

impl FrameHandler {
    async fn handle(&self, path: PathBuf, sequence: u64) {
        let recording_id = self.session.lock().recording.as_ref().map(|r| r.id);

        let frame = match self.storage.save_frame(&path, recording_id).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(frame = %path.display(), error = %e, "Could not save frame, skipping");
                return;
            }
        };

        let dispatcher = match &self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => {
                debug!(frame_id = frame.id, "Detection disabled, frame saved only");
                return;
            }
        };

        self.session.lock().stats.frames_dispatched += 1;
        let outcome = dispatcher.dispatch_frame(&path, sequence).await;

        match &outcome {
            DispatchOutcome::Cancelled => return,
            DispatchOutcome::Detected { .. } => self.session.lock().stats.detections += 1,
            DispatchOutcome::Failed { .. } => self.session.lock().stats.detection_errors += 1,
            DispatchOutcome::NoDetection => {}
        }

        if let Err(e) = self
            .storage
            .update_frame_processed(frame.id, outcome.detection_occurred(), None)
            .await
        {
            warn!(frame_id = frame.id, error = %e, "Could not mark frame processed");
        }
    }
}

/// Wires the encoder, monitors, watcher and detection together.
pub struct PipelineCoordinator {
    config: CaptureConfig,
    storage: Arc<dyn Storage>,
    detector: Option<Arc<dyn DetectionBackend>>,
    state: PipelineState,
    session: Session,
    token: CancellationToken,
    encoder: Option<EncoderHandle>,
    tasks: Vec<JoinHandle<()>>,
    lifecycle: Option<RecordingLifecycle>,
    recording_path: Option<PathBuf>,
}

impl PipelineCoordinator {
    pub fn new(config: CaptureConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            detector: None,
            state: PipelineState::Idle,
            session: Arc::new(Mutex::new(SessionState::default())),
            token: CancellationToken::new(),
            encoder: None,
            tasks: Vec::new(),
            lifecycle: None,
            recording_path: None,
        }
    }

    /// Use `detector` instead of the HTTP client built from configuration.
    pub fn with_detector(mut self, detector: Arc<dyn DetectionBackend>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        self.session.lock().stats
    }

    /// Root cancellation token; cancelling it does not stop the encoder.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn encoder_pid(&self) -> Option<u32> {
        self.encoder.as_ref().and_then(|e| e.pid())
    }

    /// Start capturing. Fails only if the pipeline cannot reach `Running`.
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::Idle {
            return Err(PipelineError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        self.state = PipelineState::Starting;
        info!("Starting capture pipeline");

        if let Err(e) = self.launch().await {
            error!(error = %e, "Pipeline failed to start");
            self.abort_start().await;
            self.state = PipelineState::Stopped;
            return Err(e);
        }

        self.state = PipelineState::Running;
        self.set_camera_status(CameraStatus::Active).await;
        self.record_event(NewEvent::new(
            EventType::SystemStart,
            Severity::Low,
            "System Started",
            "Capture pipeline started",
        ))
        .await;

        info!(pid = ?self.encoder_pid(), "Capture pipeline running");
        Ok(())
    }

    async fn launch(&mut self) -> Result<(), PipelineError> {
        let output_dir = prepare_output_dir(&self.config.encoder.output_dir).await?;
        let stream = StreamUrl::from_config(&self.config.camera)?;

        let session_stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut params =
            SegmentParams::from_config(&self.config.camera, &self.config.encoder, &session_stamp);
        params.output_dir = output_dir.clone();

        let lifecycle = RecordingLifecycle::new(self.storage.clone(), session_stamp.as_str());
        let recording_path = params.recording_path();
        let recording = lifecycle.open(&recording_path).await;
        self.session.lock().recording = recording;
        self.lifecycle = Some(lifecycle);
        self.recording_path = Some(recording_path);

        let dispatcher = self.build_dispatcher(&output_dir)?;

        if params.frame_interval_secs.is_some() {
            let (frames, watch_task) =
                FrameWatcher::new(&output_dir, self.config.detection.settle_delay())
                    .spawn(self.token.clone())?;
            self.tasks.push(watch_task);

            let handler = Arc::new(FrameHandler {
                storage: self.storage.clone(),
                dispatcher,
                session: self.session.clone(),
            });
            self.tasks.push(tokio::spawn(handle_frames(
                frames,
                handler,
                self.session.clone(),
                self.config.detection.max_in_flight.max(1),
                self.token.clone(),
            )));
        } else {
            info!("Frame saving disabled, not watching for frames");
        }

        let supervisor = ProcessSupervisor::new(&self.config.encoder.program, self.storage.clone());
        let (encoder, streams) = supervisor.start(&stream, &params)?;
        self.encoder = Some(encoder);

        self.spawn_monitor(StreamLabel::Stdout, streams.stdout);
        self.spawn_monitor(StreamLabel::Stderr, streams.stderr);

        Ok(())
    }

    fn build_dispatcher(
        &self,
        output_dir: &Path,
    ) -> Result<Option<DetectionDispatcher>, PipelineError> {
        let config = &self.config.detection;
        if !config.enabled {
            info!("Detection disabled");
            return Ok(None);
        }

        let backend: Arc<dyn DetectionBackend> = match &self.detector {
            Some(detector) => detector.clone(),
            None => {
                let client = HttpDetectionClient::new(&config.base_url, config.request_timeout())?;
                info!(endpoint = %client.endpoint(), "Detection service configured");
                Arc::new(client)
            }
        };

        Ok(Some(DetectionDispatcher::new(
            backend,
            RetryPolicy::new(config.max_attempts, config.backoff_step()),
            PathMapping::new(output_dir, &config.remote_root),
            config.confidence_threshold,
            self.storage.clone(),
            self.token.clone(),
        )))
    }

    fn spawn_monitor<R>(&mut self, label: StreamLabel, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let monitor = OutputMonitor::new(label, self.storage.clone());
        let session = self.session.clone();
        let token = self.token.clone();

        self.tasks.push(tokio::spawn(async move {
            let summary = monitor.run(reader, token).await;
            session.lock().stats.encoder_errors += summary.connectivity_failures;
        }));
    }

    /// Best-effort cleanup after a failed start.
    async fn abort_start(&mut self) {
        self.token.cancel();

        if let Some(encoder) = self.encoder.take() {
            encoder.stop(self.config.encoder.stop_grace()).await;
        }

        let tasks = std::mem::take(&mut self.tasks);
        wait_for_tasks(tasks, self.config.shutdown.timeout()).await;

        let recording = self.session.lock().recording.take();
        if let Some(recording) = recording {
            self.set_camera_status(CameraStatus::Error).await;
            self.close_recording(recording).await;
        }
    }

    /// Stop capturing and wait, bounded by the shutdown timeout, for every
    /// task to exit. The encoder is always terminated.
    pub async fn stop(&mut self) -> Result<PipelineStats, PipelineError> {
        if self.state != PipelineState::Running {
            return Err(PipelineError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        }

        self.state = PipelineState::Stopping;
        info!("Stopping capture pipeline");

        let deadline = Instant::now() + self.config.shutdown.timeout();
        self.token.cancel();

        if let Some(encoder) = self.encoder.take() {
            let outcome = encoder.stop(self.config.encoder.stop_grace()).await;
            debug!(outcome = ?outcome, "Encoder terminated");
            if let ExitOutcome::Exited(_) = outcome {
                self.session.lock().stats.encoder_errors += 1;
            }
        }

        let tasks = std::mem::take(&mut self.tasks);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !wait_for_tasks(tasks, remaining).await {
            warn!("Shutdown timed out, continuing");
        }

        let recording = self.session.lock().recording.take();
        if let Some(recording) = recording {
            self.close_recording(recording).await;
        }

        self.set_camera_status(CameraStatus::Inactive).await;
        self.record_event(NewEvent::new(
            EventType::SystemStop,
            Severity::Low,
            "System Stopped",
            "Capture pipeline stopped",
        ))
        .await;

        self.state = PipelineState::Stopped;

        let stats = self.stats();
        info!(
            frames_seen = stats.frames_seen,
            frames_dispatched = stats.frames_dispatched,
            detections = stats.detections,
            detection_errors = stats.detection_errors,
            encoder_errors = stats.encoder_errors,
            "Capture pipeline stopped"
        );

        Ok(stats)
    }

    async fn close_recording(&self, recording: RecordingRef) {
        if let (Some(lifecycle), Some(path)) = (&self.lifecycle, &self.recording_path) {
            lifecycle.close(recording, path).await;
        }
    }

    async fn set_camera_status(&self, status: CameraStatus) {
        if let Err(e) = self.storage.update_camera_status(status).await {
            warn!(status = status.as_str(), error = %e, "Could not update camera status");
        }
    }

    async fn record_event(&self, event: NewEvent) {
        if let Err(e) = self.storage.create_event(event).await {
            warn!(error = %e, "Could not record event");
        }
    }
}

async fn prepare_output_dir(dir: &Path) -> Result<PathBuf, PipelineError> {
    let to_error = |source| PipelineError::OutputDir {
        path: dir.to_path_buf(),
        source,
    };

    tokio::fs::create_dir_all(dir).await.map_err(to_error)?;
    // Watch events report paths under the resolved directory
    tokio::fs::canonicalize(dir).await.map_err(to_error)
}

/// Assign sequence numbers in arrival order and fan frames out, at most
/// `max_in_flight` at a time.
async fn handle_frames(
    mut frames: mpsc::Receiver<PathBuf>,
    handler: Arc<FrameHandler>,
    session: Session,
    max_in_flight: usize,
    token: CancellationToken,
) {
    let limit = Arc::new(Semaphore::new(max_in_flight));
    let mut in_flight = JoinSet::new();

    loop {
        let path = tokio::select! {
            _ = token.cancelled() => break,
            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_frame_task(result);
                continue;
            }
            path = frames.recv() => match path {
                Some(path) => path,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let sequence = {
            let mut state = session.lock();
            state.sequence += 1;
            state.stats.frames_seen += 1;
            state.sequence
        };
        info!(sequence = sequence, frame = %path.display(), "Processing frame");

        let handler = handler.clone();
        in_flight.spawn(async move {
            handler.handle(path, sequence).await;
            drop(permit);
        });
    }

    // In-flight dispatches observe the same token
    while let Some(result) = in_flight.join_next().await {
        log_frame_task(result);
    }
    debug!("Frame handler stopped");
}

fn log_frame_task(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            error!(error = %e, "Frame task failed");
        }
    }
}

/// Wait for `handles` to finish within `timeout`.
///
/// Returns false and aborts the stragglers if the timeout elapses.
pub async fn wait_for_tasks(handles: Vec<JoinHandle<()>>, timeout: Duration) -> bool {
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    let count = handles.len();

    match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        error!(error = %e, "Pipeline task failed");
                    }
                }
            }
            true
        }
        Err(_) => {
            warn!(
                tasks = count,
                timeout_ms = timeout.as_millis() as u64,
                "Timed out waiting for pipeline tasks"
            );
            for abort in aborts {
                abort.abort();
            }
            false
        }
    }
}
