//! Configuration management for the capture service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the capture service.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Camera stream configuration
    pub camera: CameraConfig,

    /// Encoder process configuration
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Detection service configuration
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Shutdown behaviour
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Logging configuration
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Camera stream connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// RTSP stream URL (e.g., "rtsp://192.168.1.100:554/stream1")
    pub url: String,

    /// Camera username, interpolated into the stream URL
    #[serde(default)]
    pub username: Option<String>,

    /// Camera password, interpolated into the stream URL
    #[serde(default)]
    pub password: Option<String>,

    /// RTSP transport protocol
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Socket I/O timeout handed to the encoder, in seconds (0 disables)
    #[serde(default = "default_camera_timeout")]
    pub timeout_secs: u64,
}

/// In-process storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Recordings, frames and events retained per collection
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

/// Encoder (ffmpeg) process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    /// Encoder executable
    #[serde(default = "default_program")]
    pub program: String,

    /// Directory receiving video segments and frame images
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Length of each video segment in seconds
    #[serde(default = "default_segment_secs")]
    pub segment_secs: u32,

    /// One frame is extracted every this many seconds
    #[serde(default = "default_frame_interval_secs")]
    pub frame_interval_secs: u32,

    /// Whether the parallel frame output is enabled
    #[serde(default = "default_true")]
    pub save_frames: bool,

    /// Video codec
    #[serde(default = "default_codec")]
    pub codec: String,

    /// Encoder preset
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Encoder tuning
    #[serde(default = "default_tune")]
    pub tune: String,

    /// Time the encoder gets to exit after a quit request, in milliseconds
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

/// Detection service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Whether frames are dispatched for detection
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Detection service base URL
    #[serde(default = "default_detection_url")]
    pub base_url: String,

    /// Per-attempt request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum number of attempts per frame
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff step; attempt N is followed by a sleep of N * step
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,

    /// Minimum confidence for a detection to raise an event
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Root of the output directory as seen by the detection service
    #[serde(default = "default_remote_root")]
    pub remote_root: PathBuf,

    /// Maximum number of frames in flight against the detection service
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Delay between a frame creation notification and reading the frame
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Upper bound on waiting for background tasks, in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_camera_timeout() -> u64 {
    30
}
fn default_program() -> String {
    "ffmpeg".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}
fn default_segment_secs() -> u32 {
    60
}
fn default_frame_interval_secs() -> u32 {
    5
}
fn default_true() -> bool {
    true
}
fn default_codec() -> String {
    "libx264".to_string()
}
fn default_preset() -> String {
    "ultrafast".to_string()
}
fn default_tune() -> String {
    "zerolatency".to_string()
}
fn default_stop_grace_ms() -> u64 {
    5000
}
fn default_detection_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_step_ms() -> u64 {
    1000
}
fn default_confidence_threshold() -> f64 {
    0.5
}
fn default_remote_root() -> PathBuf {
    PathBuf::from("/app/data")
}
fn default_max_in_flight() -> usize {
    1
}
fn default_settle_delay_ms() -> u64 {
    100
}
fn default_history_limit() -> usize {
    1000
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            output_dir: default_output_dir(),
            segment_secs: default_segment_secs(),
            frame_interval_secs: default_frame_interval_secs(),
            save_frames: true,
            codec: default_codec(),
            preset: default_preset(),
            tune: default_tune(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_detection_url(),
            request_timeout_secs: default_request_timeout(),
            max_attempts: default_max_attempts(),
            backoff_step_ms: default_backoff_step_ms(),
            confidence_threshold: default_confidence_threshold(),
            remote_root: default_remote_root(),
            max_in_flight: default_max_in_flight(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Environment source, e.g. CAPTURE_CAMERA__URL, CAPTURE_DETECTION__MAX_ATTEMPTS.
fn environment() -> Environment {
    Environment::with_prefix("CAPTURE")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl CaptureConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with CAPTURE_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(environment())
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder().add_source(environment()).build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.camera.url.is_empty() {
            return Err(ConfigValidationError::MissingField("camera.url".to_string()));
        }
        if !self.camera.url.starts_with("rtsp://") && !self.camera.url.starts_with("rtsps://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.url".to_string(),
                message: "URL must start with rtsp:// or rtsps://".to_string(),
            });
        }

        if self.encoder.segment_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "encoder.segment_secs".to_string(),
                message: "Segment length must be greater than 0".to_string(),
            });
        }

        if self.encoder.frame_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "encoder.frame_interval_secs".to_string(),
                message: "Frame interval must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.confidence_threshold".to_string(),
                message: "Threshold must be within [0, 1]".to_string(),
            });
        }

        if self.detection.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.max_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        if self.detection.max_in_flight == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.max_in_flight".to_string(),
                message: "At least one in-flight detection is required".to_string(),
            });
        }

        if self.storage.history_limit == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.history_limit".to_string(),
                message: "History limit must be greater than 0".to_string(),
            });
        }

        if self.detection.enabled && self.detection.base_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "detection.base_url".to_string(),
            ));
        }

        Ok(())
    }
}

impl CameraConfig {
    /// Get stream timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl EncoderConfig {
    /// Get the quit grace period as Duration.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl DetectionConfig {
    /// Get per-attempt request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get the backoff step as Duration.
    pub fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.backoff_step_ms)
    }

    /// Get the settle delay as Duration.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl ShutdownConfig {
    /// Get shutdown timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
