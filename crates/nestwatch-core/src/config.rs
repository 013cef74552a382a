use std::path::Path;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{NestwatchError, Result};

/// Environment variable that overrides `classifier.api_key`.
pub const CLASSIFIER_API_KEY_ENV: &str = "NESTWATCH_CLASSIFIER_API_KEY";
/// Environment variable that overrides `notifier.token`.
pub const NOTIFIER_TOKEN_ENV: &str = "NESTWATCH_NOTIFIER_TOKEN";
/// Environment variable that overrides `summarizer.api_key`.
pub const SUMMARIZER_API_KEY_ENV: &str = "NESTWATCH_SUMMARIZER_API_KEY";

/// Top-level configuration for the Nestwatch monitor.
///
/// Loaded once at startup from `~/.nestwatch/config.toml` (or the path given
/// on the command line) and passed by reference to each component. The
/// monitoring sections have no defaults: a missing section or required key is
/// a startup-fatal [`NestwatchError::Config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NestwatchConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    pub camera: CameraConfig,
    pub motion: MotionConfig,
    pub danger: DangerConfig,
    pub escalation: EscalationConfig,
    pub classifier: ClassifierConfig,
    pub notifier: NotifierConfig,
    pub diary: DiaryConfig,
    #[serde(default)]
    pub router: RouterConfig,
    /// Optional language-model summary for the daily digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarizer: Option<SummarizerConfig>,
}

impl NestwatchConfig {
    /// Load, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NestwatchError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse without validating or applying overrides.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save the configuration as pretty TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Fill credentials from the environment. `lookup` is `std::env::var`
    /// in production.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(CLASSIFIER_API_KEY_ENV).filter(|v| !v.is_empty()) {
            self.classifier.api_key = Some(key);
        }
        if let Some(token) = lookup(NOTIFIER_TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.notifier.token = Some(token);
        }
        if let Some(summarizer) = self.summarizer.as_mut() {
            if let Some(key) = lookup(SUMMARIZER_API_KEY_ENV).filter(|v| !v.is_empty()) {
                summarizer.api_key = Some(key);
            }
        }
    }

    /// Check ranges and cross-field requirements.
    pub fn validate(&self) -> Result<()> {
        self.camera.validate()?;
        self.motion.validate()?;
        self.danger.validate()?;
        self.escalation.validate()?;
        self.classifier.validate()?;
        self.notifier.validate()?;
        self.diary.validate()?;
        if let Some(summarizer) = &self.summarizer {
            summarizer.validate()?;
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> NestwatchError {
    NestwatchError::Config(msg.into())
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the diary archive.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.nestwatch/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Poll a camera's JPEG snapshot endpoint.
    HttpSnapshot,
    /// Replay image files from a directory.
    Replay,
}

/// Camera / frame source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Target sampling rate in frames per second.
    pub frame_rate: f64,
    pub source: SourceKind,
    /// Snapshot URL for `http_snapshot`.
    #[serde(default)]
    pub url: Option<String>,
    /// Image directory for `replay`.
    #[serde(default)]
    pub replay_dir: Option<String>,
    /// A source is stalled after this many frame intervals without a frame.
    #[serde(default = "default_stall_factor")]
    pub stall_factor: f64,
    /// Reconnect attempts per disconnect.
    #[serde(default = "default_camera_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_camera_retry_wait")]
    pub retry_wait_secs: f64,
}

fn default_stall_factor() -> f64 {
    5.0
}

fn default_camera_max_retry() -> u32 {
    3
}

fn default_camera_retry_wait() -> f64 {
    2.0
}

impl CameraConfig {
    pub fn frame_interval(&self) -> Duration {
        secs(1.0 / self.frame_rate)
    }

    pub fn stall_timeout(&self) -> Duration {
        secs(self.stall_factor / self.frame_rate)
    }

    pub fn retry_wait(&self) -> Duration {
        secs(self.retry_wait_secs)
    }

    fn validate(&self) -> Result<()> {
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(invalid("camera.frame_rate must be a positive number"));
        }
        if !(self.stall_factor.is_finite() && self.stall_factor >= 1.0) {
            return Err(invalid("camera.stall_factor must be at least 1.0"));
        }
        match self.source {
            SourceKind::HttpSnapshot if self.url.as_deref().map_or(true, str::is_empty) => {
                Err(invalid("camera.url is required for the http_snapshot source"))
            }
            SourceKind::Replay
                if self.replay_dir.as_deref().map_or(true, str::is_empty) =>
            {
                Err(invalid("camera.replay_dir is required for the replay source"))
            }
            _ => Ok(()),
        }
    }
}

/// Motion detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Changed pixels at or above which a tick counts as motion.
    pub motion_threshold: u64,
    /// Minimum absolute luma delta for a pixel to count as changed.
    #[serde(default = "default_pixel_delta")]
    pub pixel_delta_threshold: u8,
    /// Gaussian blur applied before differencing. 0 disables it.
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,
    /// Downscale frames to this width before comparing. 0 keeps full size.
    #[serde(default)]
    pub analysis_width: u32,
}

fn default_pixel_delta() -> u8 {
    30
}

fn default_blur_sigma() -> f32 {
    1.0
}

impl MotionConfig {
    pub fn new(motion_threshold: u64) -> Self {
        Self {
            motion_threshold,
            pixel_delta_threshold: default_pixel_delta(),
            blur_sigma: default_blur_sigma(),
            analysis_width: 0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.motion_threshold == 0 {
            return Err(invalid("motion.motion_threshold must be greater than 0"));
        }
        if self.pixel_delta_threshold == 0 {
            return Err(invalid("motion.pixel_delta_threshold must be greater than 0"));
        }
        if !(self.blur_sigma.is_finite() && self.blur_sigma >= 0.0) {
            return Err(invalid("motion.blur_sigma must be zero or positive"));
        }
        Ok(())
    }
}

/// Danger evaluation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DangerConfig {
    /// Seconds without motion before the subject counts as stuck.
    pub stuck_time_threshold_secs: u64,
    /// Classifier results below this confidence never alert.
    pub min_confidence_score: f64,
}

impl DangerConfig {
    pub fn stuck_time_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_time_threshold_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.stuck_time_threshold_secs == 0 {
            return Err(invalid("danger.stuck_time_threshold_secs must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence_score) {
            return Err(invalid("danger.min_confidence_score must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Escalation gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Classify at least this often even without motion.
    pub periodic_interval_secs: u64,
    /// Longest side of the snapshot sent to the classifier.
    #[serde(default = "default_image_max_size")]
    pub image_max_size: u32,
    /// JPEG quality (1-100).
    #[serde(default = "default_image_quality")]
    pub image_quality: u8,
}

fn default_image_max_size() -> u32 {
    1024
}

fn default_image_quality() -> u8 {
    85
}

impl EscalationConfig {
    pub fn new(periodic_interval_secs: u64) -> Self {
        Self {
            periodic_interval_secs,
            image_max_size: default_image_max_size(),
            image_quality: default_image_quality(),
        }
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.periodic_interval_secs == 0 {
            return Err(invalid("escalation.periodic_interval_secs must be greater than 0"));
        }
        if self.image_max_size < 16 {
            return Err(invalid("escalation.image_max_size must be at least 16"));
        }
        if !(1..=100).contains(&self.image_quality) {
            return Err(invalid("escalation.image_quality must be within 1-100"));
        }
        Ok(())
    }
}

/// Detailed classifier endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_classifier_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_classifier_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_classifier_retry_wait")]
    pub retry_wait_secs: f64,
}

fn default_classifier_timeout() -> f64 {
    15.0
}

fn default_classifier_max_retry() -> u32 {
    3
}

fn default_classifier_retry_wait() -> f64 {
    1.0
}

impl ClassifierConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            timeout_secs: default_classifier_timeout(),
            max_retry: default_classifier_max_retry(),
            retry_wait_secs: default_classifier_retry_wait(),
        }
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    pub fn retry_wait(&self) -> Duration {
        secs(self.retry_wait_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(invalid("classifier.endpoint must not be empty"));
        }
        if !(self.timeout_secs.is_finite() && self.timeout_secs > 0.0) {
            return Err(invalid("classifier.timeout_secs must be positive"));
        }
        Ok(())
    }
}

/// How alerts and digests are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    /// Write notifications to the log only.
    Log,
    /// POST notifications as JSON to a webhook.
    Webhook,
}

/// Notifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub kind: NotifierKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Recipient address forwarded to the webhook.
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default = "default_notifier_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_notifier_retry_wait")]
    pub retry_wait_secs: f64,
}

fn default_notifier_max_retry() -> u32 {
    3
}

fn default_notifier_retry_wait() -> f64 {
    2.0
}

impl NotifierConfig {
    pub fn log() -> Self {
        Self {
            kind: NotifierKind::Log,
            url: None,
            token: None,
            recipient: None,
            max_retry: default_notifier_max_retry(),
            retry_wait_secs: default_notifier_retry_wait(),
        }
    }

    pub fn retry_wait(&self) -> Duration {
        secs(self.retry_wait_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.kind == NotifierKind::Webhook && self.url.as_deref().map_or(true, str::is_empty) {
            return Err(invalid("notifier.url is required for the webhook notifier"));
        }
        Ok(())
    }
}

/// Diary and digest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiaryConfig {
    /// Local time of day ("HH:MM") at which the daily digest is sent.
    pub daily_digest_time: String,
    /// Consecutive same-category entries closer than this are collapsed.
    /// 0 disables collapsing.
    #[serde(default = "default_collapse_window")]
    pub collapse_window_secs: u64,
    /// Archive directory. Defaults to `<data_dir>/diary`.
    #[serde(default)]
    pub archive_dir: Option<String>,
}

fn default_collapse_window() -> u64 {
    300
}

impl DiaryConfig {
    pub fn new(daily_digest_time: impl Into<String>) -> Self {
        Self {
            daily_digest_time: daily_digest_time.into(),
            collapse_window_secs: default_collapse_window(),
            archive_dir: None,
        }
    }

    pub fn digest_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.daily_digest_time.trim(), "%H:%M").map_err(|e| {
            invalid(format!(
                "diary.daily_digest_time '{}' is not HH:MM: {}",
                self.daily_digest_time, e
            ))
        })
    }

    pub fn collapse_window(&self) -> Duration {
        Duration::from_secs(self.collapse_window_secs)
    }

    fn validate(&self) -> Result<()> {
        self.digest_time().map(|_| ())
    }
}

/// Digest summarizer endpoint. Absent means digests are rendered from the
/// entries alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_summarizer_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_summarizer_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_classifier_retry_wait")]
    pub retry_wait_secs: f64,
}

fn default_summarizer_timeout() -> f64 {
    30.0
}

fn default_summarizer_max_retry() -> u32 {
    1
}

impl SummarizerConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            timeout_secs: default_summarizer_timeout(),
            max_retry: default_summarizer_max_retry(),
            retry_wait_secs: default_classifier_retry_wait(),
        }
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    pub fn retry_wait(&self) -> Duration {
        secs(self.retry_wait_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(invalid("summarizer.endpoint must not be empty"));
        }
        if !(self.timeout_secs.is_finite() && self.timeout_secs > 0.0) {
            return Err(invalid("summarizer.timeout_secs must be positive"));
        }
        Ok(())
    }
}

/// Decision router switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Record superseded danger results in the diary only, without alerting.
    pub suppress_superseded_alerts: bool,
}
