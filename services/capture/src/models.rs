//! Records exchanged with the storage collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle status of a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Recording,
    Completed,
    Failed,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Recording => "recording",
            RecordingStatus::Completed => "completed",
            RecordingStatus::Failed => "failed",
        }
    }
}

/// One continuous capture session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: i64,
    pub file_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end
    pub duration_secs: i64,
    pub size_bytes: u64,
    pub status: RecordingStatus,
}

/// Final measurements of a recording, computed when it is closed.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedRecording {
    pub file_path: PathBuf,
    pub end_time: DateTime<Utc>,
    pub duration_secs: i64,
    pub size_bytes: u64,
}

/// One still image extracted from the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: i64,
    pub recording_id: Option<i64>,
    pub file_path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub thumbnail_path: Option<String>,
    pub processed: bool,
    pub has_detection: bool,
}

/// Event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity of a detection event for the dominant confidence.
    ///
    /// `(.., 0.7]` is low, `(0.7, 0.9]` medium and anything above 0.9 high.
    pub fn for_confidence(confidence: f64) -> Self {
        if confidence > 0.9 {
            Severity::High
        } else if confidence > 0.7 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PersonDetected,
    VehicleDetected,
    ObjectDetected,
    CameraError,
    EncoderExited,
    DetectionError,
    SystemStart,
    SystemStop,
}

impl EventType {
    /// Event type for the dominant class of a detection.
    pub fn for_class(class: &str) -> Self {
        match class {
            "person" => EventType::PersonDetected,
            "car" | "truck" | "bus" | "motorcycle" => EventType::VehicleDetected,
            _ => EventType::ObjectDetected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PersonDetected => "person_detected",
            EventType::VehicleDetected => "vehicle_detected",
            EventType::ObjectDetected => "object_detected",
            EventType::CameraError => "camera_error",
            EventType::EncoderExited => "encoder_exited",
            EventType::DetectionError => "detection_error",
            EventType::SystemStart => "system_start",
            EventType::SystemStop => "system_stop",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event about to be recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewEvent {
    pub event_type: EventType,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn new(
        event_type: EventType,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            severity,
            title: title.into(),
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A recorded event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: i64,
    pub event_type: EventType,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Camera availability as reported to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraStatus {
    Active,
    Inactive,
    Error,
}

impl CameraStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStatus::Active => "active",
            CameraStatus::Inactive => "inactive",
            CameraStatus::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_severity_boundaries() {
        assert_eq!(Severity::for_confidence(0.70 - EPS), Severity::Low);
        assert_eq!(Severity::for_confidence(0.70), Severity::Low);
        assert_eq!(Severity::for_confidence(0.70 + EPS), Severity::Medium);

        assert_eq!(Severity::for_confidence(0.90 - EPS), Severity::Medium);
        assert_eq!(Severity::for_confidence(0.90), Severity::Medium);
        assert_eq!(Severity::for_confidence(0.90 + EPS), Severity::High);
    }

    #[test]
    fn test_severity_extremes() {
        assert_eq!(Severity::for_confidence(0.0), Severity::Low);
        assert_eq!(Severity::for_confidence(1.0), Severity::High);
        assert!(Severity::Low < Severity::Critical);
    }

    #[test]
    fn test_event_type_for_class() {
        assert_eq!(EventType::for_class("person"), EventType::PersonDetected);
        assert_eq!(EventType::for_class("car"), EventType::VehicleDetected);
        assert_eq!(EventType::for_class("truck"), EventType::VehicleDetected);
        assert_eq!(EventType::for_class("dog"), EventType::ObjectDetected);
    }

    #[test]
    fn test_enum_serialization() {
        assert_eq!(
            serde_json::to_string(&EventType::PersonDetected).unwrap(),
            "\"person_detected\""
        );
        assert_eq!(serde_json::to_string(&Severity::Medium).unwrap(), "\"medium\"");
        assert_eq!(
            serde_json::to_string(&RecordingStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(CameraStatus::Inactive.as_str(), "inactive");
    }
}
