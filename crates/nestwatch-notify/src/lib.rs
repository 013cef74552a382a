//! Nestwatch Notify crate - delivery of danger alerts and daily digests.
//!
//! Provides the `Notifier` trait, a `LogNotifier` that writes to the trace
//! log, a `WebhookNotifier` that POSTs JSON with retries, a
//! `RecordingNotifier` for tests, and the message rendering shared by all of
//! them.

pub mod message;
pub mod webhook;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use nestwatch_core::config::{NotifierConfig, NotifierKind};
use nestwatch_core::error::NestwatchError;
use nestwatch_core::types::{DailyDigest, DangerAlert};

pub use message::{render_alert, render_digest, Message};
pub use webhook::WebhookNotifier;

/// Best-effort delivery channel. Failures are reported to the caller, which
/// logs them; nothing is queued for later.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_alert(&self, alert: &DangerAlert) -> Result<(), NestwatchError>;

    async fn send_digest(&self, digest: &DailyDigest) -> Result<(), NestwatchError>;

    fn name(&self) -> &str;
}

/// Build the notifier selected by `[notifier] kind`.
pub fn build_notifier(config: &NotifierConfig) -> Result<Arc<dyn Notifier>, NestwatchError> {
    match config.kind {
        NotifierKind::Log => Ok(Arc::new(LogNotifier)),
        NotifierKind::Webhook => Ok(Arc::new(WebhookNotifier::new(config)?)),
    }
}

// =============================================================================
// Log notifier
// =============================================================================

/// Writes rendered messages to the log. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_alert(&self, alert: &DangerAlert) -> Result<(), NestwatchError> {
        let msg = render_alert(alert);
        tracing::warn!(
            alert_id = %alert.id,
            category = %alert.category,
            confidence = alert.confidence,
            superseded = alert.superseded,
            subject = %msg.subject,
            "{}",
            msg.body
        );
        Ok(())
    }

    async fn send_digest(&self, digest: &DailyDigest) -> Result<(), NestwatchError> {
        let msg = render_digest(digest);
        tracing::info!(
            day = %digest.day,
            entries = digest.entries.len(),
            subject = %msg.subject,
            "{}",
            msg.body
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

// =============================================================================
// Recording notifier
// =============================================================================

/// Keeps every alert and digest in memory. Can be switched to fail.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    alerts: Arc<Mutex<Vec<DangerAlert>>>,
    digests: Arc<Mutex<Vec<DailyDigest>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every delivery fails.
    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.set_failing(true);
        notifier
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn alerts(&self) -> Vec<DangerAlert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn digests(&self) -> Vec<DailyDigest> {
        self.digests.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), NestwatchError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(NestwatchError::delivery("recording", "delivery disabled"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_alert(&self, alert: &DangerAlert) -> Result<(), NestwatchError> {
        self.check()?;
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert.clone());
        }
        Ok(())
    }

    async fn send_digest(&self, digest: &DailyDigest) -> Result<(), NestwatchError> {
        self.check()?;
        if let Ok(mut digests) = self.digests.lock() {
            digests.push(digest.clone());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{NaiveDate, Utc};
    use nestwatch_core::types::{Category, TriggerReason};
    use uuid::Uuid;

    fn alert() -> DangerAlert {
        DangerAlert {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category: Category::FallRisk,
            confidence: 0.81,
            description: "Climbing the rail".to_string(),
            reason: TriggerReason::MotionTriggered,
            superseded: false,
            image: None,
        }
    }

    fn empty_digest() -> DailyDigest {
        DailyDigest {
            id: Uuid::new_v4(),
            day: NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            entries: vec![],
            representative: None,
            category_counts: BTreeMap::new(),
            generated_at: Utc::now(),
            summary: None,
        }
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        let notifier = LogNotifier;
        notifier.send_alert(&alert()).await.unwrap();
        notifier.send_digest(&empty_digest()).await.unwrap();
        assert_eq!(notifier.name(), "log");
    }

    #[tokio::test]
    async fn test_recording_notifier_records() {
        let notifier = RecordingNotifier::new();
        let a = alert();
        notifier.send_alert(&a).await.unwrap();
        notifier.send_digest(&empty_digest()).await.unwrap();
        assert_eq!(notifier.alerts(), vec![a]);
        assert_eq!(notifier.digests().len(), 1);
    }

    #[tokio::test]
    async fn test_recording_notifier_failure_mode() {
        let notifier = RecordingNotifier::failing();
        let err = notifier.send_alert(&alert()).await.unwrap_err();
        assert!(matches!(err, NestwatchError::DeliveryFailure { .. }));
        assert!(notifier.alerts().is_empty());

        notifier.set_failing(false);
        notifier.send_alert(&alert()).await.unwrap();
        assert_eq!(notifier.alerts().len(), 1);
    }

    #[test]
    fn test_build_notifier_by_kind() {
        let notifier = build_notifier(&NotifierConfig::log()).unwrap();
        assert_eq!(notifier.name(), "log");

        let mut webhook = NotifierConfig::log();
        webhook.kind = NotifierKind::Webhook;
        assert!(build_notifier(&webhook).is_err());
        webhook.url = Some("http://127.0.0.1:9/notify".to_string());
        assert_eq!(build_notifier(&webhook).unwrap().name(), "webhook");
    }
}
