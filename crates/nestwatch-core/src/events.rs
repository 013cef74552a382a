use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Category, TriggerReason};

/// Observable events emitted by the monitoring loop.
///
/// Broadcast to any subscriber (log sinks, tests, a future dashboard).
/// Emission never blocks the loop; lagging subscribers lose events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum MonitorEvent {
    // =========================================================================
    // Session
    // =========================================================================
    MonitoringStarted {
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    MonitoringStopped {
        session_id: Uuid,
        frames_sampled: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Sampling
    // =========================================================================
    /// A tick crossed the motion threshold.
    MotionDetected {
        sequence: u64,
        changed_area: u64,
        timestamp: DateTime<Utc>,
    },

    /// No frame arrived in time; the tick counted as still.
    SourceStalled { timestamp: DateTime<Utc> },

    /// The subject has been still for at least the stuck threshold.
    StuckTransition {
        still_secs: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Escalation
    // =========================================================================
    ClassificationRequested {
        request_id: Uuid,
        reason: TriggerReason,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },

    /// A trigger arrived while a request was outstanding and was held
    /// as the pending follow-up.
    ClassificationCoalesced {
        reason: TriggerReason,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },

    ClassificationCompleted {
        request_id: Uuid,
        reason: TriggerReason,
        category: Category,
        original_category: Category,
        confidence: f64,
        failed: bool,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Actions
    // =========================================================================
    AlertRaised {
        alert_id: Uuid,
        category: Category,
        confidence: f64,
        superseded: bool,
        timestamp: DateTime<Utc>,
    },

    AlertDeliveryFailed {
        alert_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    DiaryRecorded {
        entry_id: Uuid,
        category: Category,
        collapsed: bool,
        timestamp: DateTime<Utc>,
    },

    DigestFlushed {
        day: NaiveDate,
        entry_count: usize,
        timestamp: DateTime<Utc>,
    },
}

impl MonitorEvent {
    /// Short machine-readable name, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::MonitoringStarted { .. } => "monitoring_started",
            MonitorEvent::MonitoringStopped { .. } => "monitoring_stopped",
            MonitorEvent::MotionDetected { .. } => "motion_detected",
            MonitorEvent::SourceStalled { .. } => "source_stalled",
            MonitorEvent::StuckTransition { .. } => "stuck_transition",
            MonitorEvent::ClassificationRequested { .. } => "classification_requested",
            MonitorEvent::ClassificationCoalesced { .. } => "classification_coalesced",
            MonitorEvent::ClassificationCompleted { .. } => "classification_completed",
            MonitorEvent::AlertRaised { .. } => "alert_raised",
            MonitorEvent::AlertDeliveryFailed { .. } => "alert_delivery_failed",
            MonitorEvent::DiaryRecorded { .. } => "diary_recorded",
            MonitorEvent::DigestFlushed { .. } => "digest_flushed",
        }
    }
}
