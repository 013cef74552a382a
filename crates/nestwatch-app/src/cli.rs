//! CLI argument definitions for the Nestwatch monitor.
//!
//! Priority resolution: CLI args > env vars > config file.

use clap::Parser;
use std::path::PathBuf;

/// Nestwatch - watches a sleeping infant, alerts on danger, keeps a diary.
#[derive(Parser, Debug)]
#[command(name = "nestwatch", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Data directory for the diary archive.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Replay images from this directory instead of the configured camera.
    #[arg(long = "replay")]
    pub replay: Option<PathBuf>,

    /// Print every monitor event to stdout as a JSON line.
    #[arg(long = "events")]
    pub print_events: bool,

    /// Load and validate the configuration, then exit.
    #[arg(long = "check-config")]
    pub check_config: bool,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > NESTWATCH_CONFIG env var > ~/.nestwatch/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("NESTWATCH_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the tracing filter directive.
    ///
    /// Priority: --log-level flag > RUST_LOG env var > config file value.
    pub fn resolve_log_filter(&self, config_level: &str) -> String {
        if let Some(ref level) = self.log_level {
            return level.clone();
        }
        match std::env::var("RUST_LOG") {
            Ok(filter) if !filter.trim().is_empty() => filter,
            _ => config_level.to_string(),
        }
    }

    /// Resolve the data directory override, if any.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".nestwatch").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".nestwatch").join("config.toml");
    }
    PathBuf::from("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_flag_wins() {
        let args = CliArgs::parse_from(["nestwatch", "--config", "/etc/nestwatch.toml"]);
        assert_eq!(args.resolve_config_path(), PathBuf::from("/etc/nestwatch.toml"));
    }

    #[test]
    fn test_log_level_flag_wins() {
        let args = CliArgs::parse_from(["nestwatch", "-l", "debug"]);
        assert_eq!(args.resolve_log_filter("warn"), "debug");
    }

    #[test]
    fn test_flags_parse() {
        let args = CliArgs::parse_from([
            "nestwatch",
            "--replay",
            "/tmp/frames",
            "--data-dir",
            "/tmp/nw",
            "--events",
        ]);
        assert_eq!(args.replay, Some(PathBuf::from("/tmp/frames")));
        assert_eq!(args.resolve_data_dir().as_deref(), Some("/tmp/nw"));
        assert!(args.print_events);
        assert!(!args.check_config);
    }
}
