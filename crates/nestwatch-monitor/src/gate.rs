//! Escalation gate: decides when a frame goes to the detailed classifier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use nestwatch_classifier::ClassifierError;
use nestwatch_core::config::NestwatchConfig;
use nestwatch_core::types::{
    Category, ClassificationRequest, ClassificationResult, Frame, Snapshot, TriggerReason,
};

use crate::worker::Completion;

/// A frame chosen for classification, not yet encoded.
///
/// The worker turns it into a [`ClassificationRequest`] carrying the same
/// id, so events raised at dispatch match the completion.
#[derive(Debug, Clone)]
pub struct Escalation {
    pub id: Uuid,
    pub reason: TriggerReason,
    pub frame: Frame,
}

impl Escalation {
    pub fn new(reason: TriggerReason, frame: Frame) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason,
            frame,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.frame.sequence
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.frame.timestamp
    }

    /// Attach the encoded snapshot.
    pub fn into_request(self, snapshot: Snapshot) -> ClassificationRequest {
        ClassificationRequest {
            id: self.id,
            reason: self.reason,
            frame_sequence: self.frame.sequence,
            frame_timestamp: self.frame.timestamp,
            snapshot,
        }
    }

    /// The request as it would have been sent, with no image data. Used
    /// when the escalation fails before a snapshot exists.
    pub fn unencoded_request(&self) -> ClassificationRequest {
        ClassificationRequest {
            id: self.id,
            reason: self.reason,
            frame_sequence: self.frame.sequence,
            frame_timestamp: self.frame.timestamp,
            snapshot: Snapshot {
                frame_sequence: self.frame.sequence,
                captured_at: self.frame.timestamp,
                width: self.frame.width,
                height: self.frame.height,
                jpeg: Default::default(),
            },
        }
    }
}

/// Outcome of one tick at the gate.
#[derive(Debug)]
pub enum GateDecision {
    /// Nothing triggered.
    Idle,
    /// A trigger fired with no frame available to send.
    NoFrame(TriggerReason),
    /// Send this frame to the classifier now.
    Dispatch(Escalation),
    /// A request is already in flight; the trigger was held as the pending
    /// follow-up.
    Coalesced {
        reason: TriggerReason,
        sequence: u64,
    },
}

/// A classifier outcome after confidence filtering, still tagged with the
/// request it answers.
#[derive(Debug, Clone)]
pub struct GatedResult {
    pub request_id: Uuid,
    pub reason: TriggerReason,
    pub frame_sequence: u64,
    pub frame_timestamp: DateTime<Utc>,
    pub snapshot: Snapshot,
    pub category: Category,
    /// What the classifier said before filtering.
    pub original_category: Category,
    pub confidence: f64,
    pub description: String,
    pub completed_at: DateTime<Utc>,
    /// No usable verdict: transport failure, unparseable reply or a frame
    /// that could not be encoded.
    pub failed: bool,
    pub raw_response: Option<String>,
}

impl GatedResult {
    pub fn downgraded(&self) -> bool {
        self.category != self.original_category
    }
}

#[derive(Debug)]
struct PendingTrigger {
    reason: TriggerReason,
    frame: Frame,
}

/// Per-tick escalation policy.
///
/// Triggers are motion, a stuck transition, and the periodic fallback. At
/// most one request is in flight, guarded by an atomic check-and-set. While
/// one is outstanding, further triggers fold into a single pending follow-up
/// holding the most recent frame and the highest-priority reason seen.
#[derive(Debug)]
pub struct EscalationGate {
    in_flight: AtomicBool,
    pending: Option<PendingTrigger>,
    periodic_interval: chrono::Duration,
    /// Frame-clock time of the last dispatch, seeded by the first tick.
    last_dispatch: Option<DateTime<Utc>>,
    min_confidence: f64,
}

impl EscalationGate {
    pub fn new(periodic_interval: Duration, min_confidence: f64) -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            pending: None,
            periodic_interval: chrono::Duration::from_std(periodic_interval)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            last_dispatch: None,
            min_confidence,
        }
    }

    pub fn from_config(config: &NestwatchConfig) -> Self {
        Self::new(
            config.escalation.periodic_interval(),
            config.danger.min_confidence_score,
        )
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Evaluate one tick.
    ///
    /// `frame` is the most recent retained frame, which on a stalled tick is
    /// older than `now`.
    pub fn on_tick(
        &mut self,
        frame: Option<&Frame>,
        is_motion: bool,
        stuck: bool,
        now: DateTime<Utc>,
    ) -> GateDecision {
        let anchor = *self.last_dispatch.get_or_insert(now);
        let periodic = now - anchor >= self.periodic_interval;

        let reason = [
            (stuck, TriggerReason::StuckTriggered),
            (is_motion, TriggerReason::MotionTriggered),
            (periodic, TriggerReason::PeriodicSample),
        ]
        .into_iter()
        .filter(|(fired, _)| *fired)
        .map(|(_, reason)| reason)
        .max_by_key(|reason| reason.priority());

        let Some(reason) = reason else {
            return GateDecision::Idle;
        };
        let Some(frame) = frame else {
            debug!(reason = %reason, "Trigger fired before any frame was retained");
            return GateDecision::NoFrame(reason);
        };

        if self.try_acquire() {
            self.last_dispatch = Some(now);
            return GateDecision::Dispatch(Escalation::new(reason, frame.clone()));
        }

        let reason = match &self.pending {
            Some(p) if p.reason.priority() > reason.priority() => p.reason,
            _ => reason,
        };
        self.pending = Some(PendingTrigger {
            reason,
            frame: frame.clone(),
        });
        GateDecision::Coalesced {
            reason,
            sequence: frame.sequence,
        }
    }

    /// Accept a completed request: release the in-flight slot, filter the
    /// result, and dispatch the pending follow-up if there is one.
    pub fn on_result(&mut self, completion: Completion) -> (GatedResult, Option<Escalation>) {
        self.in_flight.store(false, Ordering::Release);
        let gated = self.filter(completion);

        let follow_up = self.pending.take().and_then(|pending| {
            if !self.try_acquire() {
                return None;
            }
            self.last_dispatch = Some(pending.frame.timestamp);
            Some(Escalation::new(pending.reason, pending.frame))
        });

        (gated, follow_up)
    }

    fn try_acquire(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn filter(&self, completion: Completion) -> GatedResult {
        let Completion { request, outcome } = completion;
        let (result, failed, raw_response) = match outcome {
            Ok(result) => (result, false, None),
            Err(e) => {
                let raw = e.raw_response().map(str::to_string);
                let description = failure_description(&e);
                (ClassificationResult::unknown(description, Utc::now()), true, raw)
            }
        };

        let original_category = result.category;
        let category = if result.confidence < self.min_confidence {
            Category::Unknown
        } else {
            result.category
        };

        GatedResult {
            request_id: request.id,
            reason: request.reason,
            frame_sequence: request.frame_sequence,
            frame_timestamp: request.frame_timestamp,
            snapshot: request.snapshot,
            category,
            original_category,
            confidence: result.confidence,
            description: result.description,
            completed_at: result.timestamp,
            failed,
            raw_response,
        }
    }
}

fn failure_description(err: &ClassifierError) -> String {
    match err.raw_response() {
        Some(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
        _ => format!("classification failed: {}", err),
    }
}
