//! Daily digest summaries written by a language model.
//!
//! The service receives the day's diary as text and answers with
//!
//! ```json
//! {"subject_highlight": "...", "summary": "...", "highlight": "...", "notifications": ["..."]}
//! ```
//!
//! wrapped or fenced the same way classifier replies can be.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use nestwatch_core::config::SummarizerConfig;
use nestwatch_core::types::{DailyDigest, DigestSummary};

use crate::error::ClassifierError;
use crate::parser::strip_code_fence;

/// Turns a day's diary into a short narrative.
///
/// An `Err` leaves the digest to be rendered from its entries alone.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, digest: &DailyDigest) -> Result<DigestSummary, ClassifierError>;

    /// Human-readable name for logs.
    fn name(&self) -> &str;
}

/// The diary as one line per entry, oldest first.
pub fn diary_text(digest: &DailyDigest) -> String {
    let mut text = String::new();
    for entry in &digest.entries {
        let _ = write!(
            text,
            "{} {}",
            entry.timestamp.with_timezone(&Local).format("%H:%M"),
            entry.category
        );
        if entry.occurrences > 1 {
            let _ = write!(text, " (x{})", entry.occurrences);
        }
        if !entry.description.trim().is_empty() {
            let _ = write!(text, ": {}", entry.description.trim());
        }
        text.push('\n');
    }
    text
}

/// Instruction sent with the diary.
pub fn summary_prompt(digest: &DailyDigest) -> String {
    format!(
        "Below is today's ({}) baby monitor diary, one observation per line.\n\n{}\n\
         Write a JSON object with exactly these fields: \
         \"subject_highlight\": the day's highlight in a few words for an email subject; \
         \"summary\": about 200 characters summarising the day, without headings; \
         \"highlight\": about 200 characters describing the most notable moment; \
         \"notifications\": a list of risks or things to watch, one short sentence each. \
         Answer with JSON only.",
        digest.day.format("%Y-%m-%d"),
        diary_text(digest)
    )
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Wrapped { result: DigestSummary },
    Bare(DigestSummary),
}

/// Parse a summarizer reply. A reply without a summary text is malformed.
pub fn parse_summary(raw: &str) -> Result<DigestSummary, ClassifierError> {
    let malformed = |reason: String| ClassifierError::MalformedResponse {
        reason,
        raw: raw.to_string(),
    };
    let envelope: Envelope = serde_json::from_str(strip_code_fence(raw)).map_err(|e| malformed(e.to_string()))?;
    let summary = match envelope {
        Envelope::Wrapped { result } => result,
        Envelope::Bare(summary) => summary,
    };
    if summary.summary.trim().is_empty() {
        return Err(malformed("summary is empty".to_string()));
    }
    Ok(summary)
}

// =============================================================================
// HTTP implementation
// =============================================================================

#[derive(Debug, Serialize)]
struct SummarizeBody {
    day: String,
    prompt: String,
    entry_count: usize,
}

/// Posts the diary to a JSON summarization endpoint.
pub struct HttpSummarizer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
    max_retry: u32,
    retry_wait: Duration,
}

impl HttpSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self, ClassifierError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ClassifierError::Transport(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            timeout: config.timeout(),
            max_retry: config.max_retry,
            retry_wait: config.retry_wait(),
        })
    }

    async fn attempt(&self, body: &SummarizeBody) -> Result<DigestSummary, ClassifierError> {
        let mut request = self.client.post(&self.endpoint).timeout(self.timeout).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.map_reqwest(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_reqwest(e))?;
        if !status.is_success() {
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        parse_summary(&text)
    }

    fn map_reqwest(&self, err: reqwest::Error) -> ClassifierError {
        if err.is_timeout() {
            ClassifierError::Timeout(self.timeout.as_millis() as u64)
        } else {
            ClassifierError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, digest: &DailyDigest) -> Result<DigestSummary, ClassifierError> {
        let body = SummarizeBody {
            day: digest.day.to_string(),
            prompt: summary_prompt(digest),
            entry_count: digest.entries.len(),
        };

        let attempts = self.max_retry + 1;
        let mut attempt = 1;
        loop {
            match self.attempt(&body).await {
                Ok(summary) => {
                    debug!(day = %digest.day, attempt, "Digest summary received");
                    return Ok(summary);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        day = %digest.day,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Summarizer attempt failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

// =============================================================================
// Mock implementation
// =============================================================================

/// Summarizer with a fixed answer, or a fixed failure. Counts calls.
#[derive(Debug, Clone)]
pub struct MockSummarizer {
    reply: Result<DigestSummary, String>,
    seen: Arc<Mutex<VecDeque<DailyDigest>>>,
}

impl MockSummarizer {
    pub fn answering(summary: DigestSummary) -> Self {
        Self {
            reply: Ok(summary),
            seen: Arc::default(),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            reply: Err(reason.to_string()),
            seen: Arc::default(),
        }
    }

    /// Digests it was asked to summarize.
    pub fn digests(&self) -> Vec<DailyDigest> {
        self.seen
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, digest: &DailyDigest) -> Result<DigestSummary, ClassifierError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push_back(digest.clone());
        }
        self.reply.clone().map_err(ClassifierError::Transport)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    use chrono::{NaiveDate, TimeZone, Utc};
    use nestwatch_core::types::{Category, DiaryEntry, TriggerReason};
    use uuid::Uuid;

    use crate::test_server::serve;

    fn digest() -> DailyDigest {
        let entry = |secs: i64, category: Category, description: &str, occurrences: u32| DiaryEntry {
            id: Uuid::new_v4(),
            timestamp: Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap(),
            ended_at: Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap(),
            category,
            original_category: category,
            confidence: 0.9,
            description: description.to_string(),
            reason: TriggerReason::PeriodicSample,
            occurrences,
            classification_failed: false,
            image: None,
        };
        DailyDigest {
            id: Uuid::new_v4(),
            day: NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            entries: vec![
                entry(0, Category::Normal, "Asleep on the back", 3),
                entry(600, Category::FallRisk, "Near the edge", 1),
            ],
            representative: None,
            category_counts: BTreeMap::new(),
            generated_at: Utc::now(),
            summary: None,
        }
    }

    fn config(endpoint: String) -> SummarizerConfig {
        SummarizerConfig {
            retry_wait_secs: 0.01,
            ..SummarizerConfig::new(endpoint)
        }
    }

    #[test]
    fn test_diary_text_lists_entries() {
        let text = diary_text(&digest());
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("normal (x3): Asleep on the back"));
        assert!(lines[1].ends_with("fall_risk: Near the edge"));
        assert!(summary_prompt(&digest()).contains("2026-10-18"));
    }

    #[test]
    fn test_parse_bare_and_fenced() {
        let raw = r#"{"subject_highlight":"Calm","summary":"Slept well.","highlight":"Big yawn.","notifications":["Rail down once"]}"#;
        let s = parse_summary(raw).unwrap();
        assert_eq!(s.subject_highlight, "Calm");
        assert_eq!(s.notifications, vec!["Rail down once".to_string()]);

        let fenced = "```json\n{\"result\": {\"subject_highlight\":\"Calm\",\"summary\":\"Slept well.\",\"highlight\":\"\"}}\n```";
        let s = parse_summary(fenced).unwrap();
        assert_eq!(s.summary, "Slept well.");
        assert!(s.notifications.is_empty());
    }

    #[test]
    fn test_parse_rejects_prose_and_empty_summary() {
        let err = parse_summary("It was a lovely day").unwrap_err();
        assert_eq!(err.raw_response(), Some("It was a lovely day"));

        let empty = r#"{"subject_highlight":"x","summary":"  ","highlight":"y"}"#;
        assert!(matches!(
            parse_summary(empty),
            Err(ClassifierError::MalformedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_summarizer_retries_then_parses() {
        let (url, hits) = serve(vec![
            (503, "busy"),
            (200, r#"{"subject_highlight":"First roll","summary":"An active day.","highlight":"Rolled over.","notifications":[]}"#),
        ])
        .await;
        let summarizer = HttpSummarizer::new(&config(url)).unwrap();
        let summary = summarizer.summarize(&digest()).await.unwrap();
        assert_eq!(summary.subject_highlight, "First roll");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_http_summarizer_malformed_reply_is_error() {
        let (url, hits) = serve(vec![(200, "Sorry, I cannot help"), (200, "{}")]).await;
        let summarizer = HttpSummarizer::new(&config(url)).unwrap();
        assert!(summarizer.summarize(&digest()).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mock_summarizer_records_digests() {
        let mock = MockSummarizer::failing("offline");
        assert!(matches!(
            mock.summarize(&digest()).await,
            Err(ClassifierError::Transport(_))
        ));
        assert_eq!(mock.digests().len(), 1);
    }
}
