//! Nestwatch Classifier crate - detailed visual classification of snapshots.
//!
//! Provides the `Classifier` trait, an `HttpClassifier` that talks to a JSON
//! classification service with per-attempt timeouts and retries, and a
//! `MockClassifier` with scripted verdicts for tests. The `summary` module
//! holds the optional digest `Summarizer`.

pub mod error;
pub mod http;
pub mod parser;
pub mod summary;

#[cfg(test)]
mod test_server;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use nestwatch_core::types::{Category, ClassificationRequest, ClassificationResult};

pub use error::ClassifierError;
pub use http::HttpClassifier;
pub use parser::{parse_response, prompt_hint};
pub use summary::{HttpSummarizer, MockSummarizer, Summarizer};

// =============================================================================
// Trait
// =============================================================================

/// Service that labels a snapshot with a [`Category`].
///
/// `Err` means no usable verdict was obtained. The caller decides how to
/// record that; implementations never fabricate a category.
pub trait Classifier: Send + Sync {
    fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> impl Future<Output = Result<ClassificationResult, ClassifierError>> + Send;
}

// =============================================================================
// Mock implementation
// =============================================================================

/// A scripted verdict for [`MockClassifier`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Verdict {
        category: Category,
        confidence: f64,
        description: String,
    },
    Fail(String),
    Malformed(String),
}

impl MockReply {
    pub fn verdict(category: Category, confidence: f64, description: &str) -> Self {
        MockReply::Verdict {
            category,
            confidence,
            description: description.to_string(),
        }
    }
}

/// Classifier returning scripted replies in order, then a default `Normal`
/// verdict. Records every request it sees.
#[derive(Debug, Clone, Default)]
pub struct MockClassifier {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    seen: Arc<Mutex<Vec<ClassificationRequest>>>,
    latency: Duration,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().collect())),
            ..Self::default()
        }
    }

    /// Delay every reply, to hold requests in flight.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&self, reply: MockReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<ClassificationRequest> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Classifier for MockClassifier {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassificationResult, ClassifierError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        let reply = self.replies.lock().ok().and_then(|mut r| r.pop_front());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match reply {
            None => Ok(ClassificationResult::new(
                Category::Normal,
                0.9,
                "Sleeping quietly",
                Utc::now(),
            )),
            Some(MockReply::Verdict {
                category,
                confidence,
                description,
            }) => Ok(ClassificationResult::new(
                category,
                confidence,
                description,
                Utc::now(),
            )),
            Some(MockReply::Fail(reason)) => Err(ClassifierError::Transport(reason)),
            Some(MockReply::Malformed(raw)) => parse_response(&raw, Utc::now()),
        }
    }
}
