use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use nestwatch_core::types::{Category, DailyDigest, DiaryEntry};

/// What [`DiaryAggregator::append`] did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// Stored as a new entry with this id.
    New(Uuid),
    /// Folded into the previous entry with this id.
    Collapsed(Uuid),
}

impl Appended {
    pub fn entry_id(&self) -> Uuid {
        match self {
            Appended::New(id) | Appended::Collapsed(id) => *id,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        matches!(self, Appended::Collapsed(_))
    }
}

/// Accumulates the day's diary entries in insertion order.
///
/// A run of consecutive entries with the same category, each starting
/// within `collapse_window` of the previous one's end, is folded into a
/// single entry spanning the run. `Unknown` entries are never folded. A zero
/// window disables folding.
#[derive(Debug, Clone)]
pub struct DiaryAggregator {
    entries: Vec<DiaryEntry>,
    collapse_window: Duration,
}

impl DiaryAggregator {
    pub fn new(collapse_window: Duration) -> Self {
        Self {
            entries: Vec::new(),
            collapse_window,
        }
    }

    pub fn entries(&self) -> &[DiaryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: DiaryEntry) -> Appended {
        let window = self.collapse_window;
        if let Some(last) = self.entries.last_mut() {
            if collapses_into(window, last, &entry) {
                fold(last, entry);
                debug!(
                    entry_id = %last.id,
                    category = %last.category,
                    occurrences = last.occurrences,
                    "Diary entry collapsed into run"
                );
                return Appended::Collapsed(last.id);
            }
        }
        let id = entry.id;
        self.entries.push(entry);
        Appended::New(id)
    }

    /// Hand over the accumulated entries as the digest for `day` and clear.
    pub fn flush(&mut self, day: NaiveDate) -> DailyDigest {
        let entries = std::mem::take(&mut self.entries);
        let representative = select_representative(&entries, local_midday(day)).cloned();

        let mut category_counts = BTreeMap::new();
        for entry in &entries {
            *category_counts
                .entry(entry.category.as_str().to_string())
                .or_insert(0) += 1;
        }

        info!(
            day = %day,
            entries = entries.len(),
            representative = representative.as_ref().map(|e| e.category.as_str()).unwrap_or("none"),
            "Diary flushed"
        );

        DailyDigest {
            id: Uuid::new_v4(),
            day,
            entries,
            representative,
            category_counts,
            generated_at: Utc::now(),
            summary: None,
        }
    }
}

fn collapses_into(window: Duration, last: &DiaryEntry, next: &DiaryEntry) -> bool {
    if window.is_zero() || next.category == Category::Unknown || last.category != next.category {
        return false;
    }
    let gap = next.timestamp - last.ended_at;
    gap >= chrono::Duration::zero() && gap.to_std().map_or(false, |g| g <= window)
}

/// Merge `next` into the run `last`. The run keeps the most confident
/// observation's description and image.
fn fold(last: &mut DiaryEntry, next: DiaryEntry) {
    last.ended_at = last.ended_at.max(next.ended_at);
    last.occurrences += next.occurrences;
    if next.confidence > last.confidence {
        last.confidence = next.confidence;
        last.description = next.description;
        last.original_category = next.original_category;
        if next.image.is_some() {
            last.image = next.image;
        }
    }
}

/// 12:00 local time on `day`, as UTC.
pub fn local_midday(day: NaiveDate) -> DateTime<Utc> {
    let naive = day.and_hms_opt(12, 0, 0).unwrap_or_default();
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Pick the entry that best represents the day.
///
/// The most confident entry outside `Normal` wins, ignoring entries whose
/// classification failed; ties go to the earliest. Without one, the entry
/// closest to `midday` is used.
pub fn select_representative(entries: &[DiaryEntry], midday: DateTime<Utc>) -> Option<&DiaryEntry> {
    let notable = entries
        .iter()
        .filter(|e| e.category != Category::Normal && !e.classification_failed)
        .fold(None::<&DiaryEntry>, |best, e| match best {
            Some(b) if b.confidence >= e.confidence => Some(b),
            _ => Some(e),
        });
    if notable.is_some() {
        return notable;
    }

    entries
        .iter()
        .min_by_key(|e| (e.timestamp - midday).num_milliseconds().unsigned_abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestwatch_core::types::TriggerReason;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    fn at_offset(secs: i64) -> DateTime<Utc> {
        local_midday(day()) + chrono::Duration::seconds(secs)
    }

    fn entry(category: Category, confidence: f64, secs: i64) -> DiaryEntry {
        let ts = at_offset(secs);
        DiaryEntry {
            id: Uuid::new_v4(),
            timestamp: ts,
            ended_at: ts,
            category,
            original_category: category,
            confidence,
            description: format!("{} at {}", category, secs),
            reason: TriggerReason::PeriodicSample,
            occurrences: 1,
            classification_failed: false,
            image: None,
        }
    }

    #[test]
    fn test_flush_empty_day() {
        let mut diary = DiaryAggregator::new(Duration::ZERO);
        let digest = diary.flush(day());
        assert!(digest.is_empty());
        assert!(digest.representative.is_none());
        assert!(digest.category_counts.is_empty());
        assert_eq!(digest.day, day());
    }

    #[test]
    fn test_round_trip_preserves_order_without_collapse() {
        let mut diary = DiaryAggregator::new(Duration::ZERO);
        let entries: Vec<_> = (0..5)
            .map(|i| entry(Category::Normal, 0.9, i * 10))
            .collect();
        for e in entries.clone() {
            assert!(!diary.append(e).is_collapsed());
        }
        let digest = diary.flush(day());
        assert_eq!(digest.entries, entries);
        assert!(diary.is_empty());
        assert_eq!(diary.flush(day()).entries.len(), 0);
    }

    #[test]
    fn test_collapses_same_category_run_within_window() {
        let mut diary = DiaryAggregator::new(Duration::from_secs(300));
        let first = entry(Category::Normal, 0.8, 0);
        let first_id = first.id;
        diary.append(first);
        assert_eq!(diary.append(entry(Category::Normal, 0.95, 200)), Appended::Collapsed(first_id));
        assert_eq!(diary.append(entry(Category::Normal, 0.7, 500)), Appended::Collapsed(first_id));

        let entries = diary.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].occurrences, 3);
        assert_eq!(entries[0].ended_at, at_offset(500));
        assert_eq!(entries[0].confidence, 0.95);
        assert_eq!(entries[0].description, "normal at 200");
    }

    #[test]
    fn test_does_not_collapse_across_gap_or_category() {
        let mut diary = DiaryAggregator::new(Duration::from_secs(300));
        diary.append(entry(Category::Normal, 0.8, 0));
        assert!(!diary.append(entry(Category::Normal, 0.8, 301)).is_collapsed());
        assert!(!diary.append(entry(Category::ProneBody, 0.8, 320)).is_collapsed());
        assert!(!diary.append(entry(Category::Normal, 0.8, 330)).is_collapsed());
        assert_eq!(diary.len(), 4);
    }

    #[test]
    fn test_unknown_never_collapses() {
        let mut diary = DiaryAggregator::new(Duration::from_secs(300));
        diary.append(entry(Category::Unknown, 0.0, 0));
        assert!(!diary.append(entry(Category::Unknown, 0.0, 5)).is_collapsed());
        assert_eq!(diary.len(), 2);
    }

    #[test]
    fn test_representative_prefers_most_confident_notable() {
        let entries = vec![
            entry(Category::Normal, 0.99, 0),
            entry(Category::FallRisk, 0.75, -3600),
            entry(Category::ProneBody, 0.91, 3600),
            entry(Category::FaceCovered, 0.91, 7200),
        ];
        let rep = select_representative(&entries, local_midday(day())).unwrap();
        assert_eq!(rep.category, Category::ProneBody);
    }

    #[test]
    fn test_representative_skips_failed_classifications() {
        let mut failed = entry(Category::Unknown, 0.0, 5000);
        failed.classification_failed = true;
        let entries = vec![failed, entry(Category::Normal, 0.9, 0)];
        let rep = select_representative(&entries, local_midday(day())).unwrap();
        assert_eq!(rep.category, Category::Normal);
    }

    #[test]
    fn test_representative_falls_back_to_midday() {
        let entries = vec![
            entry(Category::Normal, 0.9, -7200),
            entry(Category::Normal, 0.9, 600),
            entry(Category::Normal, 0.9, 5400),
        ];
        let rep = select_representative(&entries, local_midday(day())).unwrap();
        assert_eq!(rep.timestamp, at_offset(600));
    }

    #[test]
    fn test_flush_counts_categories() {
        let mut diary = DiaryAggregator::new(Duration::ZERO);
        diary.append(entry(Category::Normal, 0.9, 0));
        diary.append(entry(Category::Normal, 0.9, 10));
        diary.append(entry(Category::FallRisk, 0.8, 20));
        let digest = diary.flush(day());
        assert_eq!(digest.category_counts.get("normal"), Some(&2));
        assert_eq!(digest.category_counts.get("fall_risk"), Some(&1));
        assert_eq!(digest.representative.unwrap().category, Category::FallRisk);
    }
}
