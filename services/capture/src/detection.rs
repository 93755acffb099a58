//! Detection dispatch.
//!
//! Frames are sent to the remote detection service by path reference. The
//! service sees the output directory under its own mount root, so local paths
//! are translated first. Failed calls are retried with a linear backoff;
//! when all attempts fail the frame simply counts as "no detection" and a
//! medium-severity event is recorded. A failing detection service never
//! stops capture.

use crate::models::{EventType, NewEvent, Severity};
use crate::storage::Storage;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors from a single detection attempt.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Detection request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Detection service returned status: {0}")]
    Status(u16),

    #[error("Invalid detection response: {0}")]
    Decode(String),

    #[error("Detection service reported failure: {0}")]
    Service(String),

    #[error("Detection cancelled")]
    Cancelled,
}

/// Request body of `POST /detect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRequest {
    pub image_path: String,
}

/// Response body of `POST /detect`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionResponse {
    pub success: bool,
    pub image_path: String,
    pub detections: Vec<Detection>,
    pub total_objects: u32,
    pub processing_time_ms: f64,
    pub error: Option<String>,
}

/// One classified object within a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    #[serde(default)]
    pub class_id: i64,
    /// Score in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// A detection service reachable for single attempts.
#[async_trait]
pub trait DetectionBackend: Send + Sync {
    /// Run detection on the image at `image_path` (as seen by the service).
    async fn detect(&self, image_path: &str) -> Result<DetectionResponse, DetectionError>;
}

/// HTTP client for the detection service.
pub struct HttpDetectionClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDetectionClient {
    /// Create a client for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DetectionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DetectionError::Client)?;

        Ok(Self {
            client,
            endpoint: format!("{}/detect", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DetectionBackend for HttpDetectionClient {
    async fn detect(&self, image_path: &str) -> Result<DetectionResponse, DetectionError> {
        let request = DetectionRequest {
            image_path: image_path.to_string(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(DetectionError::Transport)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(DetectionError::Status(status.as_u16()));
        }

        response
            .json::<DetectionResponse>()
            .await
            .map_err(|e| DetectionError::Decode(e.to_string()))
    }
}

/// Linear backoff without jitter: the delay after attempt `n` is `n * step`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    attempt: u32,
}

impl LinearBackoff {
    pub fn new(step: Duration) -> Self {
        Self { step, attempt: 0 }
    }

    pub fn step(&self) -> Duration {
        self.step
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        Some(self.step.saturating_mul(self.attempt))
    }
}

/// How often and how patiently a frame is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: LinearBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: LinearBackoff::new(backoff_step),
        }
    }

    /// Fresh backoff state for one call.
    pub fn backoff(&self) -> LinearBackoff {
        let mut backoff = self.backoff.clone();
        backoff.reset();
        backoff
    }

    /// Sleeps between attempts of a call that fails every time.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        (1..self.max_attempts)
            .filter_map(|_| backoff.next_backoff())
            .collect()
    }

    /// Total time spent sleeping for a call that fails every time.
    pub fn total_backoff(&self) -> Duration {
        self.schedule().into_iter().sum()
    }
}

/// Translates local frame paths to the detection service's mount root.
#[derive(Debug, Clone)]
pub struct PathMapping {
    local_root: PathBuf,
    remote_root: PathBuf,
}

impl PathMapping {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: remote_root.into(),
        }
    }

    /// Paths outside the local root are returned unchanged.
    pub fn to_remote(&self, local: &Path) -> PathBuf {
        match local.strip_prefix(&self.local_root) {
            Ok(relative) => self.remote_root.join(relative),
            Err(_) => {
                debug!(
                    path = %local.display(),
                    root = %self.local_root.display(),
                    "Frame outside local root, passing path through"
                );
                local.to_path_buf()
            }
        }
    }
}

/// Detections at or above `threshold`.
pub fn qualifying(detections: &[Detection], threshold: f64) -> Vec<&Detection> {
    detections
        .iter()
        .filter(|d| d.confidence >= threshold)
        .collect()
}

/// The highest-confidence detection; the earliest wins ties.
pub fn dominant<'a>(detections: &[&'a Detection]) -> Option<&'a Detection> {
    detections.iter().copied().fold(None, |best, d| match best {
        Some(b) if b.confidence >= d.confidence => Some(b),
        _ => Some(d),
    })
}

fn title_case(class: &str) -> String {
    class
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the event for a frame's qualifying detections.
pub fn detection_event(
    detections: &[&Detection],
    frame_path: &Path,
    sequence: u64,
) -> Option<NewEvent> {
    let main = dominant(detections)?;

    let class = title_case(&main.class);
    let frame_name = frame_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let count = detections.len();

    let mut message = format!(
        "{} detected in frame #{} with {:.1}% confidence at {}",
        class,
        sequence,
        main.confidence * 100.0,
        frame_name
    );
    if count > 1 {
        message.push_str(&format!(" (total: {} objects)", count));
    }

    let metadata = json!({
        "frame": frame_path.to_string_lossy(),
        "sequence": sequence,
        "class": main.class,
        "confidence": main.confidence,
        "objects": count,
        "detections": detections,
    });

    Some(
        NewEvent::new(
            EventType::for_class(&main.class),
            Severity::for_confidence(main.confidence),
            format!("{} Detected", class),
            message,
        )
        .with_metadata(metadata),
    )
}

/// Result of dispatching one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// At least one detection met the threshold
    Detected {
        event_type: EventType,
        severity: Severity,
        objects: usize,
    },
    /// The service answered but nothing met the threshold
    NoDetection,
    /// All attempts failed
    Failed { attempts: u32 },
    /// The pipeline shut down mid-dispatch
    Cancelled,
}

impl DispatchOutcome {
    pub fn detection_occurred(&self) -> bool {
        matches!(self, DispatchOutcome::Detected { .. })
    }
}

/// Sends frames to the detection service and records resulting events.
pub struct DetectionDispatcher {
    backend: Arc<dyn DetectionBackend>,
    policy: RetryPolicy,
    mapping: PathMapping,
    threshold: f64,
    storage: Arc<dyn Storage>,
    token: CancellationToken,
}

impl DetectionDispatcher {
    pub fn new(
        backend: Arc<dyn DetectionBackend>,
        policy: RetryPolicy,
        mapping: PathMapping,
        threshold: f64,
        storage: Arc<dyn Storage>,
        token: CancellationToken,
    ) -> Self {
        Self {
            backend,
            policy,
            mapping,
            threshold,
            storage,
            token,
        }
    }

    /// Whether a qualifying detection occurred in the frame.
    pub async fn dispatch(&self, frame_path: &Path, sequence: u64) -> bool {
        self.dispatch_frame(frame_path, sequence)
            .await
            .detection_occurred()
    }

    pub async fn dispatch_frame(&self, frame_path: &Path, sequence: u64) -> DispatchOutcome {
        let remote = self.mapping.to_remote(frame_path);
        let remote = remote.to_string_lossy();

        debug!(
            sequence = sequence,
            local = %frame_path.display(),
            remote = %remote,
            "Dispatching frame for detection"
        );

        let response = match self.request_with_retry(&remote).await {
            Ok(response) => response,
            Err((DetectionError::Cancelled, _)) => {
                debug!(sequence = sequence, "Detection cancelled");
                return DispatchOutcome::Cancelled;
            }
            Err((e, attempts)) => {
                error!(
                    sequence = sequence,
                    attempts = attempts,
                    error = %e,
                    "All detection attempts failed"
                );
                self.record_failure(frame_path, sequence, &e).await;
                return DispatchOutcome::Failed { attempts };
            }
        };

        let passed = qualifying(&response.detections, self.threshold);
        if passed.is_empty() {
            if response.detections.is_empty() {
                debug!(
                    sequence = sequence,
                    processing_ms = response.processing_time_ms,
                    "No objects detected"
                );
            } else {
                debug!(
                    sequence = sequence,
                    objects = response.detections.len(),
                    threshold = self.threshold,
                    "Objects found but below confidence threshold"
                );
            }
            return DispatchOutcome::NoDetection;
        }

        for d in &passed {
            info!(
                sequence = sequence,
                class = %d.class,
                confidence = format!("{:.1}%", d.confidence * 100.0),
                "Object detected"
            );
        }

        let event = match detection_event(&passed, frame_path, sequence) {
            Some(event) => event,
            None => return DispatchOutcome::NoDetection,
        };

        let outcome = DispatchOutcome::Detected {
            event_type: event.event_type,
            severity: event.severity,
            objects: passed.len(),
        };

        if let Err(e) = self.storage.create_event(event).await {
            warn!(sequence = sequence, error = %e, "Could not record detection event");
        }

        outcome
    }

    /// Returns the response or the last error with the number of attempts made.
    async fn request_with_retry(
        &self,
        image_path: &str,
    ) -> Result<DetectionResponse, (DetectionError, u32)> {
        let mut backoff = self.policy.backoff();
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result = tokio::select! {
                _ = self.token.cancelled() => return Err((DetectionError::Cancelled, attempt)),
                result = self.backend.detect(image_path) => result,
            };

            let err = match result {
                Ok(response) if response.success => return Ok(response),
                Ok(response) => DetectionError::Service(
                    response
                        .error
                        .unwrap_or_else(|| "unspecified error".to_string()),
                ),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                return Err((err, attempt));
            }

            let delay = backoff.next_backoff().unwrap_or(self.policy.backoff.step());
            warn!(
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Detection attempt failed, retrying"
            );

            tokio::select! {
                _ = self.token.cancelled() => return Err((DetectionError::Cancelled, attempt)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn record_failure(&self, frame_path: &Path, sequence: u64, err: &DetectionError) {
        let event = NewEvent::new(
            EventType::DetectionError,
            Severity::Medium,
            "Detection Service Error",
            format!("Detection service failed: {}", err),
        )
        .with_metadata(json!({
            "frame": frame_path.to_string_lossy(),
            "sequence": sequence,
            "error": err.to_string(),
        }));

        if let Err(e) = self.storage.create_event(event).await {
            warn!(error = %e, "Could not record detection error event");
        }
    }
}
