use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use nestwatch_core::config::ClassifierConfig;
use nestwatch_core::types::{ClassificationRequest, ClassificationResult};

use crate::error::ClassifierError;
use crate::parser::{parse_response, prompt_hint};
use crate::Classifier;

#[derive(Debug, Serialize)]
struct ClassifyBody<'a> {
    request_id: String,
    reason: &'a str,
    frame_timestamp: String,
    prompt: String,
    mime_type: &'static str,
    image: String,
}

/// Posts JPEG snapshots to a JSON classification endpoint.
///
/// Each attempt has its own timeout. Transport failures, timeouts and 5xx
/// replies are retried up to `max_retry` more times, `retry_wait` apart.
pub struct HttpClassifier {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
    max_retry: u32,
    retry_wait: Duration,
}

impl HttpClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
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

    async fn attempt(&self, body: &ClassifyBody<'_>) -> Result<ClassificationResult, ClassifierError> {
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
        parse_response(&text, Utc::now())
    }

    fn map_reqwest(&self, err: reqwest::Error) -> ClassifierError {
        if err.is_timeout() {
            ClassifierError::Timeout(self.timeout.as_millis() as u64)
        } else {
            ClassifierError::Transport(err.to_string())
        }
    }
}

impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassificationResult, ClassifierError> {
        if request.snapshot.is_empty() {
            return Err(ClassifierError::Encoding("snapshot has no image data".to_string()));
        }

        let body = ClassifyBody {
            request_id: request.id.to_string(),
            reason: request.reason.as_str(),
            frame_timestamp: request.frame_timestamp.to_rfc3339(),
            prompt: prompt_hint(request.reason),
            mime_type: "image/jpeg",
            image: BASE64.encode(request.snapshot.jpeg.as_slice()),
        };

        let attempts = self.max_retry + 1;
        let mut attempt = 1;
        loop {
            match self.attempt(&body).await {
                Ok(result) => {
                    debug!(
                        request_id = %request.id,
                        attempt,
                        category = %result.category,
                        confidence = result.confidence,
                        "Classifier answered"
                    );
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        request_id = %request.id,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Classifier attempt failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
