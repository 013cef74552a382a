//! Prompt hints and response parsing for the classifier wire format.
//!
//! The service answers with a JSON object:
//!
//! ```json
//! {"category": "prone_body", "confidence": 0.91, "description": "Lying face down"}
//! ```
//!
//! optionally wrapped as `{"result": {...}}` and optionally inside a
//! Markdown code fence, which language models like to add.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use nestwatch_core::types::{Category, ClassificationResult, TriggerReason};

use crate::error::ClassifierError;

/// Category labels the service is asked to choose from.
pub const CATEGORY_LABELS: [&str; 5] = ["normal", "prone_body", "face_covered", "fall_risk", "unknown"];

/// Instruction sent with each image, tuned to why it was escalated.
pub fn prompt_hint(reason: TriggerReason) -> String {
    let focus = match reason {
        TriggerReason::MotionTriggered => {
            "Movement was just detected. Describe what the infant is doing and \
             whether the movement put them in an unsafe position."
        }
        TriggerReason::StuckTriggered => {
            "The infant has not moved for a long time. Decide whether they are \
             simply asleep on their back, lying face down, have their face \
             covered by bedding or an object, or have fallen."
        }
        TriggerReason::PeriodicSample => {
            "Routine check. Briefly describe the infant's posture and activity."
        }
    };
    format!(
        "You are watching a baby monitor image. {} Answer with JSON only: \
         {{\"category\": one of {}, \"confidence\": number between 0 and 1, \
         \"description\": one short sentence}}.",
        focus,
        CATEGORY_LABELS.join("|")
    )
}

#[derive(Debug, Deserialize)]
struct WireVerdict {
    #[serde(alias = "label")]
    category: String,
    confidence: f64,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Wrapped { result: WireVerdict },
    Bare(WireVerdict),
}

/// Remove a surrounding Markdown code fence if present.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    let inner = inner.trim_start();
    inner
        .strip_prefix("json")
        .or_else(|| inner.strip_prefix("JSON"))
        .unwrap_or(inner)
        .trim()
}

/// Parse a classifier reply. Unrecognised category labels become
/// [`Category::Unknown`] with the label kept in the description.
pub fn parse_response(raw: &str, timestamp: DateTime<Utc>) -> Result<ClassificationResult, ClassifierError> {
    let body = strip_code_fence(raw);
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| ClassifierError::MalformedResponse {
            reason: e.to_string(),
            raw: raw.to_string(),
        })?;
    let verdict = match envelope {
        Envelope::Wrapped { result } => result,
        Envelope::Bare(verdict) => verdict,
    };

    let category = Category::from_label(&verdict.category);
    let description = if category == Category::Unknown
        && !verdict.category.trim().eq_ignore_ascii_case("unknown")
    {
        format!("[{}] {}", verdict.category.trim(), verdict.description)
    } else {
        verdict.description
    };

    Ok(ClassificationResult::new(
        category,
        verdict.confidence,
        description,
        timestamp,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_json() {
        let raw = r#"{"category": "prone_body", "confidence": 0.9, "description": "Face down on the mattress"}"#;
        let r = parse_response(raw, Utc::now()).unwrap();
        assert_eq!(r.category, Category::ProneBody);
        assert_eq!(r.confidence, 0.9);
        assert_eq!(r.description, "Face down on the mattress");
    }

    #[test]
    fn test_parse_wrapped_and_fenced() {
        let raw = "```json\n{\"result\": {\"label\": \"Fall Risk\", \"confidence\": 0.75, \"description\": \"Leaning over the rail\"}}\n```";
        let r = parse_response(raw, Utc::now()).unwrap();
        assert_eq!(r.category, Category::FallRisk);
        assert_eq!(r.description, "Leaning over the rail");
    }

    #[test]
    fn test_unknown_label_keeps_label_in_description() {
        let raw = r#"{"category": "crying", "confidence": 0.8, "description": "Upset"}"#;
        let r = parse_response(raw, Utc::now()).unwrap();
        assert_eq!(r.category, Category::Unknown);
        assert_eq!(r.description, "[crying] Upset");
    }

    #[test]
    fn test_confidence_is_clamped() {
        let raw = r#"{"category": "normal", "confidence": 3.0}"#;
        let r = parse_response(raw, Utc::now()).unwrap();
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.description, "");
    }

    #[test]
    fn test_free_text_is_malformed() {
        let raw = "The baby appears to be sleeping peacefully.";
        match parse_response(raw, Utc::now()) {
            Err(ClassifierError::MalformedResponse { raw: kept, .. }) => assert_eq!(kept, raw),
            other => panic!("expected malformed response, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_confidence_is_malformed() {
        let raw = r#"{"category": "normal", "description": "fine"}"#;
        assert!(matches!(
            parse_response(raw, Utc::now()),
            Err(ClassifierError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_prompt_hint_varies_by_reason() {
        let stuck = prompt_hint(TriggerReason::StuckTriggered);
        let motion = prompt_hint(TriggerReason::MotionTriggered);
        assert!(stuck.contains("face down"));
        assert!(motion.contains("Movement"));
        assert!(stuck.contains("prone_body|face_covered"));
    }
}
