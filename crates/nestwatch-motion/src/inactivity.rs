use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use nestwatch_core::types::MotionEvent;

/// Fired once per inactivity run, on the first tick at or past the stuck
/// threshold.
#[derive(Clone, Debug, PartialEq)]
pub struct StuckTransition {
    pub timestamp: DateTime<Utc>,
    pub still_for: Duration,
}

/// Time since the last detected motion.
///
/// A value type: [`InactivityState::advance`] returns the next state rather
/// than mutating in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InactivityState {
    /// Seeded with the first observed tick, then moved on each motion.
    pub last_motion_timestamp: Option<DateTime<Utc>>,
    pub elapsed_still: Duration,
    /// The stuck edge already fired for this run.
    pub stuck_reported: bool,
}

impl InactivityState {
    /// Fold one tick into the state.
    ///
    /// Motion resets the run. A still tick extends it; `elapsed_still` never
    /// decreases within a run, even if the clock steps backwards.
    pub fn advance(
        &self,
        timestamp: DateTime<Utc>,
        is_motion: bool,
        threshold: Duration,
    ) -> (InactivityState, Option<StuckTransition>) {
        let Some(anchor) = self.last_motion_timestamp.filter(|_| !is_motion) else {
            return (
                InactivityState {
                    last_motion_timestamp: Some(timestamp),
                    elapsed_still: Duration::ZERO,
                    stuck_reported: false,
                },
                None,
            );
        };

        let since = (timestamp - anchor).to_std().unwrap_or(Duration::ZERO);
        let elapsed_still = since.max(self.elapsed_still);

        let fire = !self.stuck_reported && elapsed_still >= threshold;
        let next = InactivityState {
            last_motion_timestamp: Some(anchor),
            elapsed_still,
            stuck_reported: self.stuck_reported || fire,
        };
        let transition = fire.then(|| StuckTransition {
            timestamp,
            still_for: elapsed_still,
        });
        (next, transition)
    }

    /// Whether the current run has already crossed the threshold.
    pub fn is_stuck(&self) -> bool {
        self.stuck_reported
    }
}

/// Owns the current [`InactivityState`] for the sampling loop.
#[derive(Debug, Clone)]
pub struct InactivityTracker {
    state: InactivityState,
    threshold: Duration,
}

impl InactivityTracker {
    pub fn new(threshold: Duration) -> Self {
        Self {
            state: InactivityState::default(),
            threshold,
        }
    }

    pub fn state(&self) -> &InactivityState {
        &self.state
    }

    pub fn update(&mut self, event: &MotionEvent) -> Option<StuckTransition> {
        self.observe(event.timestamp, event.is_motion)
    }

    /// A tick with no frame (stall or disconnect) counts as still.
    pub fn observe_still(&mut self, timestamp: DateTime<Utc>) -> Option<StuckTransition> {
        self.observe(timestamp, false)
    }

    fn observe(&mut self, timestamp: DateTime<Utc>, is_motion: bool) -> Option<StuckTransition> {
        let (next, transition) = self.state.advance(timestamp, is_motion, self.threshold);
        if let Some(t) = &transition {
            info!(still_secs = t.still_for.as_secs(), "No motion past stuck threshold");
        }
        self.state = next;
        transition
    }
}
