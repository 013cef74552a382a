use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use nestwatch_core::config::NestwatchConfig;
use nestwatch_core::types::{Category, DangerAlert, DiaryEntry};

use crate::gate::GatedResult;

/// Where one classification result goes.
#[derive(Debug, Clone)]
pub struct Routing {
    /// Every result is recorded in the diary, alerted or not.
    pub diary: DiaryEntry,
    pub alert: Option<DangerAlert>,
}

/// Maps filtered classification results to alerts and diary entries.
///
/// A danger category at or above the confidence floor raises an alert.
/// Results arrive in completion order, which can differ from frame order;
/// an alert whose frame is older than the last alert already raised for
/// the same category is marked superseded (or dropped when configured).
#[derive(Debug)]
pub struct DecisionRouter {
    min_confidence: f64,
    suppress_superseded: bool,
    last_alerted: HashMap<Category, DateTime<Utc>>,
}

impl DecisionRouter {
    pub fn new(min_confidence: f64, suppress_superseded: bool) -> Self {
        Self {
            min_confidence,
            suppress_superseded,
            last_alerted: HashMap::new(),
        }
    }

    pub fn from_config(config: &NestwatchConfig) -> Self {
        Self::new(
            config.danger.min_confidence_score,
            config.router.suppress_superseded_alerts,
        )
    }

    pub fn route(&mut self, result: &GatedResult) -> Routing {
        let image = Some(result.snapshot.clone()).filter(|s| !s.is_empty());

        let diary = DiaryEntry {
            id: Uuid::new_v4(),
            timestamp: result.frame_timestamp,
            ended_at: result.frame_timestamp,
            category: result.category,
            original_category: result.original_category,
            confidence: result.confidence,
            description: result.description.clone(),
            reason: result.reason,
            occurrences: 1,
            classification_failed: result.failed,
            image: image.clone(),
        };

        let alert = self.alert_for(result).map(|superseded| DangerAlert {
            id: Uuid::new_v4(),
            timestamp: result.frame_timestamp,
            category: result.category,
            confidence: result.confidence,
            description: result.description.clone(),
            reason: result.reason,
            superseded,
            image,
        });

        Routing { diary, alert }
    }

    /// `Some(superseded)` when the result warrants an alert.
    fn alert_for(&mut self, result: &GatedResult) -> Option<bool> {
        if !result.category.is_danger() || result.confidence < self.min_confidence {
            return None;
        }

        let superseded = self
            .last_alerted
            .get(&result.category)
            .map_or(false, |last| *last > result.frame_timestamp);

        if superseded {
            if self.suppress_superseded {
                debug!(
                    category = %result.category,
                    sequence = result.frame_sequence,
                    "Superseded alert suppressed"
                );
                return None;
            }
            info!(
                category = %result.category,
                sequence = result.frame_sequence,
                "Alert for an older frame than the last one sent"
            );
        } else {
            self.last_alerted.insert(result.category, result.frame_timestamp);
        }
        Some(superseded)
    }
}
