use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Why a frame was escalated to the detailed classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// The motion detector flagged the tick as motion.
    MotionTriggered,
    /// The inactivity tracker crossed the stuck threshold.
    StuckTriggered,
    /// The periodic fallback interval elapsed.
    PeriodicSample,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::MotionTriggered => "motion_triggered",
            TriggerReason::StuckTriggered => "stuck_triggered",
            TriggerReason::PeriodicSample => "periodic_sample",
        }
    }

    /// Ordering used when several triggers fire on the same tick.
    /// Higher wins.
    pub fn priority(&self) -> u8 {
        match self {
            TriggerReason::StuckTriggered => 3,
            TriggerReason::MotionTriggered => 2,
            TriggerReason::PeriodicSample => 1,
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier verdict on a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Nothing of concern.
    Normal,
    /// Lying face down.
    ProneBody,
    /// Face obstructed by bedding or an object.
    FaceCovered,
    /// About to fall or already fallen.
    FallRisk,
    /// Unparseable, failed, or low-confidence classification.
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Normal => "normal",
            Category::ProneBody => "prone_body",
            Category::FaceCovered => "face_covered",
            Category::FallRisk => "fall_risk",
            Category::Unknown => "unknown",
        }
    }

    /// Categories that warrant an immediate alert.
    pub fn is_danger(&self) -> bool {
        matches!(
            self,
            Category::ProneBody | Category::FaceCovered | Category::FallRisk
        )
    }

    /// Map a classifier label to a category.
    ///
    /// Matching is case-insensitive and accepts a few spellings. Anything
    /// unrecognised becomes `Unknown`.
    pub fn from_label(label: &str) -> Category {
        let normalized = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "normal" | "safe" => Category::Normal,
            "prone_body" | "prone" | "face_down" => Category::ProneBody,
            "face_covered" | "covered_face" => Category::FaceCovered,
            "fall_risk" | "fall" | "falling" => Category::FallRisk,
            _ => Category::Unknown,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Frames and motion
// =============================================================================

/// A timestamped RGB8 sample from the camera.
#[derive(Clone, PartialEq)]
pub struct Frame {
    /// Position in the sampled sequence, starting at 0 per session.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    /// Packed RGB8, row-major, `width * height * 3` bytes.
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(
        sequence: u64,
        timestamp: DateTime<Utc>,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Self {
        Self {
            sequence,
            timestamp,
            width,
            height,
            pixels,
        }
    }

    /// A frame filled with a single RGB colour. Handy for tests and replay.
    pub fn solid(
        sequence: u64,
        timestamp: DateTime<Utc>,
        width: u32,
        height: u32,
        rgb: [u8; 3],
    ) -> Self {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Self::new(sequence, timestamp, width, height, pixels)
    }

    /// Whether the buffer length matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.pixels.len() == (self.width as usize) * (self.height as usize) * 3
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Outcome of comparing one sampled frame with its predecessor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionEvent {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    /// Number of pixels whose luma changed by at least the pixel delta.
    pub changed_area: u64,
    pub is_motion: bool,
}

impl MotionEvent {
    /// Classify `changed_area` against `motion_threshold` (inclusive).
    pub fn from_area(
        timestamp: DateTime<Utc>,
        sequence: u64,
        changed_area: u64,
        motion_threshold: u64,
    ) -> Self {
        Self {
            timestamp,
            sequence,
            changed_area,
            is_motion: changed_area >= motion_threshold,
        }
    }

    /// A neutral event: no change, no motion.
    pub fn still(timestamp: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            timestamp,
            sequence,
            changed_area: 0,
            is_motion: false,
        }
    }
}

// =============================================================================
// Snapshots and classification
// =============================================================================

/// A JPEG-encoded copy of a frame, shared cheaply between the classifier
/// request, alerts and diary entries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub frame_sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    #[serde(skip)]
    pub jpeg: Arc<Vec<u8>>,
}

impl Snapshot {
    /// Stable file name for archiving this snapshot.
    pub fn file_name(&self) -> String {
        format!(
            "frame-{}-{}.jpg",
            self.captured_at.format("%Y%m%dT%H%M%S%3fZ"),
            self.frame_sequence
        )
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }
}

/// A request for the detailed classifier. Consumed exactly once.
#[derive(Clone, Debug)]
pub struct ClassificationRequest {
    pub id: Uuid,
    pub reason: TriggerReason,
    pub frame_sequence: u64,
    pub frame_timestamp: DateTime<Utc>,
    pub snapshot: Snapshot,
}

impl ClassificationRequest {
    pub fn new(reason: TriggerReason, snapshot: Snapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason,
            frame_sequence: snapshot.frame_sequence,
            frame_timestamp: snapshot.captured_at,
            snapshot,
        }
    }
}

/// Parsed classifier output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl ClassificationResult {
    /// Build a result, clamping confidence into `[0, 1]`. A NaN confidence
    /// yields an `Unknown` result with zero confidence.
    pub fn new(
        category: Category,
        confidence: f64,
        description: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        if confidence.is_nan() {
            return Self::unknown(description, timestamp);
        }
        Self {
            category,
            confidence: confidence.clamp(0.0, 1.0),
            description: description.into(),
            timestamp,
        }
    }

    pub fn unknown(description: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            category: Category::Unknown,
            confidence: 0.0,
            description: description.into(),
            timestamp,
        }
    }
}

// =============================================================================
// Router outputs
// =============================================================================

/// One line of the activity diary. A collapsed run spans
/// `timestamp..=ended_at` and counts its `occurrences`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub category: Category,
    /// Category reported by the classifier before confidence filtering.
    pub original_category: Category,
    pub confidence: f64,
    pub description: String,
    pub reason: TriggerReason,
    pub occurrences: u32,
    /// The classifier could not be reached or its reply was unusable.
    pub classification_failed: bool,
    pub image: Option<Snapshot>,
}

impl DiaryEntry {
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.timestamp
    }
}

/// An urgent notification. Built and handed straight to the notifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DangerAlert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    pub confidence: f64,
    pub description: String,
    pub reason: TriggerReason,
    /// A newer result of the same category already alerted before this
    /// one completed.
    pub superseded: bool,
    pub image: Option<Snapshot>,
}

/// The day's diary handed to the digest sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyDigest {
    pub id: Uuid,
    pub day: NaiveDate,
    pub entries: Vec<DiaryEntry>,
    pub representative: Option<DiaryEntry>,
    pub category_counts: BTreeMap<String, usize>,
    pub generated_at: DateTime<Utc>,
    /// Written by the digest summarizer when one is configured and answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<DigestSummary>,
}

impl DailyDigest {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Narrative summary of a day's diary.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DigestSummary {
    /// A few words for the message subject.
    pub subject_highlight: String,
    pub summary: String,
    /// The moment of the day worth retelling.
    pub highlight: String,
    /// Risks or things to keep an eye on, one per item.
    #[serde(default)]
    pub notifications: Vec<String>,
}
