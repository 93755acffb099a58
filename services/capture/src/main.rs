//! Camwatch capture service.
//!
//! Records an RTSP camera through ffmpeg and sends sampled frames to the
//! detection service until interrupted.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with CAPTURE_)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use camwatch_capture::{CaptureConfig, LoggingConfig, MemoryStore, PipelineCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "camwatch-capture",
        version = env!("CARGO_PKG_VERSION"),
        output_dir = %config.encoder.output_dir.display(),
        detection = config.detection.enabled,
        "Starting capture service"
    );

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    let store = Arc::new(MemoryStore::with_history_limit(
        config.storage.history_limit,
    ));
    let mut pipeline = PipelineCoordinator::new(config, store.clone());

    pipeline
        .start()
        .await
        .context("Failed to start capture pipeline")?;

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let stats = pipeline.stats();
                info!(
                    frames_seen = stats.frames_seen,
                    detections = stats.detections,
                    detection_errors = stats.detection_errors,
                    encoder_errors = stats.encoder_errors,
                    "Pipeline stats"
                );
            }
        }
    }

    info!("Initiating graceful shutdown...");
    pipeline
        .stop()
        .await
        .context("Failed to stop capture pipeline")?;

    log_final_summary(&store);

    info!("Shutdown complete");
    Ok(())
}

/// Load configuration, falling back to the environment alone.
fn load_config() -> anyhow::Result<CaptureConfig> {
    let config = CaptureConfig::load().or_else(|e| {
        // Logging is not initialized yet
        eprintln!("Failed to load config from files ({}), trying environment", e);
        CaptureConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("camwatch_capture={}", level).parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Log what was recorded during the session.
fn log_final_summary(store: &MemoryStore) {
    info!("=== Final Summary ===");

    let totals = store.totals();
    let frames = store.frames();
    let processed = frames.iter().filter(|f| f.processed).count();
    let with_detection = frames.iter().filter(|f| f.has_detection).count();
    info!(
        frames = totals.frames,
        retained = frames.len(),
        processed = processed,
        with_detection = with_detection,
        "Frames"
    );

    for recording in store.recordings() {
        info!(
            recording_id = recording.id,
            path = %recording.file_path.display(),
            status = recording.status.as_str(),
            duration_secs = recording.duration_secs,
            size_bytes = recording.size_bytes,
            "Recording"
        );
    }

    let events = store.events();
    info!(events = totals.events, retained = events.len(), "Events");
    for event in events.iter().rev().take(10) {
        info!(
            event_type = event.event_type.as_str(),
            severity = event.severity.as_str(),
            title = %event.title,
            "Recent event"
        );
    }
}
