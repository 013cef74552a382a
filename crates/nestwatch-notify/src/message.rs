//! Human-readable rendering of alerts and daily digests.

use std::fmt::Write as _;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use nestwatch_core::types::{Category, DailyDigest, DangerAlert, DiaryEntry, DigestSummary};

const HIGHLIGHT_MAX_CHARS: usize = 40;

/// A subject line and plain-text body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

fn label(category: Category) -> String {
    category.as_str().replace('_', " ")
}

fn local_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%H:%M:%S").to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

pub fn render_alert(alert: &DangerAlert) -> Message {
    let mut subject = format!("[DANGER] Infant needs attention ({})", label(alert.category));
    if alert.superseded {
        subject.push_str(" [earlier observation]");
    }

    let mut body = String::new();
    let _ = writeln!(
        body,
        "Possible danger detected: {} (confidence {:.0}%).",
        label(alert.category),
        alert.confidence * 100.0
    );
    let _ = writeln!(body, "Observed at {} after {}.", local_time(alert.timestamp), alert.reason);
    if !alert.description.trim().is_empty() {
        let _ = writeln!(body);
        let _ = writeln!(body, "{}", alert.description.trim());
    }
    if alert.superseded {
        let _ = writeln!(body);
        let _ = writeln!(body, "A newer alert of the same kind was already sent.");
    }
    let _ = writeln!(body);
    let _ = write!(body, "Please check on the infant now.");

    Message { subject, body }
}

fn highlight(digest: &DailyDigest) -> String {
    if let Some(summary) = digest.summary.as_ref().filter(|s| !s.subject_highlight.trim().is_empty()) {
        return truncate(&summary.subject_highlight, HIGHLIGHT_MAX_CHARS);
    }
    match &digest.representative {
        _ if digest.is_empty() => "no entries".to_string(),
        Some(entry) if !entry.description.trim().is_empty() => {
            truncate(&entry.description, HIGHLIGHT_MAX_CHARS)
        }
        Some(entry) => label(entry.category),
        None => "quiet day".to_string(),
    }
}

fn entry_line(entry: &DiaryEntry) -> String {
    let mut line = format!("{}  {}", local_time(entry.timestamp), label(entry.category));
    if entry.occurrences > 1 {
        let _ = write!(line, " (x{} until {})", entry.occurrences, local_time(entry.ended_at));
    }
    if entry.category != entry.original_category {
        let _ = write!(line, " [reported {}]", label(entry.original_category));
    }
    if !entry.description.trim().is_empty() {
        let _ = write!(line, ": {}", entry.description.trim());
    }
    line
}

fn write_summary(body: &mut String, summary: &DigestSummary) {
    let _ = writeln!(body, "{}", summary.summary.trim());
    if !summary.highlight.trim().is_empty() {
        let _ = writeln!(body);
        let _ = writeln!(body, "Today's highlight:");
        let _ = writeln!(body, "{}", summary.highlight.trim());
    }
    let _ = writeln!(body);
    let _ = writeln!(body, "Notes:");
    if summary.notifications.is_empty() {
        let _ = writeln!(body, "Nothing to report.");
    }
    for note in &summary.notifications {
        let _ = writeln!(body, "- {}", note.trim());
    }
}

pub fn render_digest(digest: &DailyDigest) -> Message {
    let subject = format!(
        "Diary ({}) - {}",
        digest.day.format("%Y/%m/%d"),
        highlight(digest)
    );

    let mut body = String::new();
    if digest.is_empty() {
        let _ = write!(body, "No diary entries were recorded today.");
        return Message { subject, body };
    }

    if let Some(summary) = &digest.summary {
        write_summary(&mut body, summary);
        let _ = writeln!(body);
    }

    let _ = writeln!(body, "{} entries recorded.", digest.entries.len());
    for (category, count) in &digest.category_counts {
        let _ = writeln!(body, "  {}: {}", category.replace('_', " "), count);
    }
    if let Some(rep) = &digest.representative {
        let _ = writeln!(body);
        let _ = writeln!(body, "Highlight: {}", entry_line(rep));
    }
    let _ = writeln!(body);
    for entry in &digest.entries {
        let _ = writeln!(body, "{}", entry_line(entry));
    }

    Message {
        subject,
        body: body.trim_end().to_string(),
    }
}
