use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use nestwatch_core::config::NotifierConfig;
use nestwatch_core::error::NestwatchError;
use nestwatch_core::types::{DailyDigest, DangerAlert, Snapshot};

use crate::message::{render_alert, render_digest, Message};
use crate::Notifier;

#[derive(Debug, Serialize)]
struct Attachment {
    file_name: String,
    mime_type: &'static str,
    data: String,
}

impl Attachment {
    fn from_snapshot(snapshot: &Snapshot) -> Option<Self> {
        (!snapshot.is_empty()).then(|| Attachment {
            file_name: snapshot.file_name(),
            mime_type: "image/jpeg",
            data: BASE64.encode(snapshot.jpeg.as_slice()),
        })
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a, T: Serialize> {
    kind: &'static str,
    recipient: Option<&'a str>,
    #[serde(flatten)]
    message: Message,
    attachment: Option<Attachment>,
    detail: &'a T,
}

/// Delivers alerts and digests as JSON POSTs.
///
/// The receiving service (mail relay, push gateway) owns the final hop.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    token: Option<String>,
    recipient: Option<String>,
    max_retry: u32,
    retry_wait: Duration,
}

impl WebhookNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Self, NestwatchError> {
        let url = config
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| NestwatchError::Config("notifier.url is not set".to_string()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NestwatchError::delivery("webhook", e))?;
        Ok(Self {
            client,
            url,
            token: config.token.clone(),
            recipient: config.recipient.clone(),
            max_retry: config.max_retry,
            retry_wait: config.retry_wait(),
        })
    }

    async fn post_once<T: Serialize + Sync>(&self, payload: &WebhookPayload<'_, T>) -> Result<(), String> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(format!("HTTP {}: {}", status.as_u16(), body))
        }
    }

    async fn post<T: Serialize + Sync>(&self, payload: WebhookPayload<'_, T>) -> Result<(), NestwatchError> {
        let attempts = self.max_retry + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.post_once(&payload).await {
                Ok(()) => {
                    info!(kind = payload.kind, attempt, subject = %payload.message.subject, "Webhook delivered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(kind = payload.kind, attempt, max_attempts = attempts, error = %e, "Webhook delivery failed");
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_wait).await;
                    }
                }
            }
        }
        Err(NestwatchError::delivery(
            "webhook",
            format!("gave up after {} attempts: {}", attempts, last_error),
        ))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_alert(&self, alert: &DangerAlert) -> Result<(), NestwatchError> {
        self.post(WebhookPayload {
            kind: "alert",
            recipient: self.recipient.as_deref(),
            message: render_alert(alert),
            attachment: alert.image.as_ref().and_then(Attachment::from_snapshot),
            detail: alert,
        })
        .await
    }

    async fn send_digest(&self, digest: &DailyDigest) -> Result<(), NestwatchError> {
        let image = digest.representative.as_ref().and_then(|e| e.image.as_ref());
        self.post(WebhookPayload {
            kind: "digest",
            recipient: self.recipient.as_deref(),
            message: render_digest(digest),
            attachment: image.and_then(Attachment::from_snapshot),
            detail: digest,
        })
        .await
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use nestwatch_core::config::NotifierKind;
    use nestwatch_core::types::{Category, TriggerReason};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    /// Accepts connections, captures each request body, answers with the
    /// next status code.
    async fn serve(statuses: Vec<u16>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let captured = bodies.clone();
        tokio::spawn(async move {
            for status in statuses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let body = read_body(&mut socket).await;
                captured.lock().unwrap().push(body);
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        (format!("http://{}/notify", addr), bodies)
    }

    async fn read_body(socket: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    return text[end + 4..].to_string();
                }
            }
        }
        String::new()
    }

    fn config(url: String) -> NotifierConfig {
        NotifierConfig {
            kind: NotifierKind::Webhook,
            url: Some(url),
            token: Some("t0ken".to_string()),
            recipient: Some("parent@example.com".to_string()),
            max_retry: 2,
            retry_wait_secs: 0.01,
        }
    }

    fn alert() -> DangerAlert {
        DangerAlert {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category: Category::ProneBody,
            confidence: 0.9,
            description: "Face down".to_string(),
            reason: TriggerReason::StuckTriggered,
            superseded: false,
            image: Some(Snapshot {
                frame_sequence: 3,
                captured_at: Utc::now(),
                width: 1,
                height: 1,
                jpeg: Arc::new(vec![0xFF, 0xD8]),
            }),
        }
    }

    #[tokio::test]
    async fn test_alert_payload_shape() {
        let (url, bodies) = serve(vec![200]).await;
        let notifier = WebhookNotifier::new(&config(url)).unwrap();
        notifier.send_alert(&alert()).await.unwrap();

        let bodies = bodies.lock().unwrap().clone();
        let json: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(json["kind"], "alert");
        assert_eq!(json["recipient"], "parent@example.com");
        assert_eq!(json["subject"], "[DANGER] Infant needs attention (prone body)");
        assert_eq!(json["attachment"]["mime_type"], "image/jpeg");
        assert_eq!(json["detail"]["category"], "prone_body");
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let (url, bodies) = serve(vec![500, 502, 200]).await;
        let notifier = WebhookNotifier::new(&config(url)).unwrap();
        notifier.send_alert(&alert()).await.unwrap();
        assert_eq!(bodies.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_delivery_failure() {
        let (url, _) = serve(vec![500, 500, 500]).await;
        let notifier = WebhookNotifier::new(&config(url)).unwrap();
        let err = notifier.send_alert(&alert()).await.unwrap_err();
        assert!(matches!(err, NestwatchError::DeliveryFailure { .. }));
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_requires_url() {
        let mut cfg = config(String::new());
        cfg.url = None;
        assert!(matches!(
            WebhookNotifier::new(&cfg),
            Err(NestwatchError::Config(_))
        ));
    }
}
