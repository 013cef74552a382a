//! Nestwatch application binary - composition root.
//!
//! 1. Load configuration from TOML (flags and environment override it)
//! 2. Initialize tracing
//! 3. Build the frame source, classifier, notifier, diary archive and the
//!    optional digest summarizer
//! 4. Run the monitoring pipeline until the source ends or Ctrl-C

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use nestwatch_capture::{FrameSampler, FrameSource, HttpSnapshotSource, ReplaySource};
use nestwatch_classifier::{HttpClassifier, HttpSummarizer};
use nestwatch_core::config::{CameraConfig, NestwatchConfig, SourceKind};
use nestwatch_core::error::NestwatchError;
use nestwatch_diary::JsonlArchive;
use nestwatch_monitor::Monitor;
use nestwatch_notify::build_notifier;

use cli::CliArgs;

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

/// Read the config file and fold in command-line and environment overrides
/// before validating.
fn load_config(args: &CliArgs, path: &Path) -> Result<NestwatchConfig, NestwatchError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        NestwatchError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    let mut config = NestwatchConfig::from_toml_str(&content)?;

    if let Some(data_dir) = args.resolve_data_dir() {
        config.general.data_dir = data_dir;
    }
    if let Some(ref dir) = args.replay {
        config.camera.source = SourceKind::Replay;
        config.camera.replay_dir = Some(dir.to_string_lossy().to_string());
    }
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn build_sampler(camera: &CameraConfig) -> Result<FrameSampler, NestwatchError> {
    let source: Box<dyn FrameSource> = match camera.source {
        SourceKind::HttpSnapshot => Box::new(HttpSnapshotSource::from_config(camera)?),
        SourceKind::Replay => Box::new(ReplaySource::from_config(camera)?),
    };
    Ok(FrameSampler::new(source, camera.frame_interval(), camera.stall_timeout()).with_pacing())
}

fn archive_dir(config: &NestwatchConfig) -> PathBuf {
    match config.diary.archive_dir {
        Some(ref dir) => resolve_data_dir(dir),
        None => resolve_data_dir(&config.general.data_dir).join("diary"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config first: it carries the default log level.
    let config_file = args.resolve_config_path();
    let config = match load_config(&args, &config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("nestwatch: {}", e);
            std::process::exit(2);
        }
    };

    // Tracing.
    let filter = args.resolve_log_filter(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Nestwatch v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration loaded");

    if args.check_config {
        println!("{}: ok", config_file.display());
        return Ok(());
    }

    // Components.
    let sampler = build_sampler(&config.camera)?;
    tracing::info!(
        source = %sampler.describe_source(),
        frame_rate = config.camera.frame_rate,
        "Frame source ready"
    );

    let classifier = Arc::new(HttpClassifier::new(&config.classifier).map_err(NestwatchError::from)?);
    tracing::info!(endpoint = %config.classifier.endpoint, "Classifier ready");

    let notifier = build_notifier(&config.notifier)?;
    tracing::info!(notifier = notifier.name(), "Notifier ready");

    let diary_dir = archive_dir(&config);
    if let Err(e) = std::fs::create_dir_all(&diary_dir) {
        tracing::error!(path = %diary_dir.display(), error = %e, "Failed to create diary directory");
        return Err(e.into());
    }
    let archive = Arc::new(JsonlArchive::new(&diary_dir));
    tracing::info!(path = %diary_dir.display(), "Diary archive ready");

    let mut monitor = Monitor::new(&config, sampler, classifier, notifier, archive)?;
    if let Some(ref summarizer) = config.summarizer {
        let http = HttpSummarizer::new(summarizer).map_err(NestwatchError::from)?;
        monitor = monitor.with_summarizer(Arc::new(http));
        tracing::info!(endpoint = %summarizer.endpoint, "Digest summarizer ready");
    }
    let handle = monitor.handle();

    // === Background tasks ===

    if args.print_events {
        let mut events = handle.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => tracing::debug!(error = %e, "Event not serializable"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event printer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, shutting down");
            ctrl_c.shutdown();
        }
    });

    // === Monitoring ===

    let report = monitor.run().await;
    tracing::info!(
        session_id = %report.session_id,
        frames = report.frames_sampled,
        dropped = report.frames_dropped,
        stalls = report.stalls,
        disconnects = report.disconnects,
        requests = report.requests_dispatched,
        alerts = report.alerts_raised,
        diary_entries = report.diary_entries,
        digests = report.digests_sent,
        "Nestwatch stopped"
    );

    Ok(())
}
