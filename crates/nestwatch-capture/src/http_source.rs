//! Camera that serves still JPEG snapshots over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tracing::{debug, info, warn};

use nestwatch_core::config::CameraConfig;
use nestwatch_core::error::NestwatchError;

use crate::{CapturedImage, FrameSource};

/// Polls a snapshot URL. Each call to `next_image` performs one GET.
pub struct HttpSnapshotSource {
    client: Client,
    url: String,
    max_retry: u32,
    retry_wait: Duration,
}

impl HttpSnapshotSource {
    pub fn new(
        url: impl Into<String>,
        request_timeout: Duration,
        max_retry: u32,
        retry_wait: Duration,
    ) -> Result<Self, NestwatchError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NestwatchError::Capture(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            max_retry,
            retry_wait,
        })
    }

    /// Build from the `[camera]` section. Requests time out after the stall
    /// timeout so a hung camera surfaces as a disconnect.
    pub fn from_config(config: &CameraConfig) -> Result<Self, NestwatchError> {
        let url = config
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| NestwatchError::Config("camera.url is not set".to_string()))?;
        Self::new(url, config.stall_timeout(), config.max_retry, config.retry_wait())
    }

    async fn fetch(&self) -> Result<CapturedImage, NestwatchError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| NestwatchError::Capture(format!("snapshot request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NestwatchError::Capture(format!(
                "snapshot request returned {}",
                status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| NestwatchError::Capture(format!("snapshot body failed: {}", e)))?;
        let timestamp = Utc::now();

        let image = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| NestwatchError::Capture(format!("decode task failed: {}", e)))?
            .map_err(|e| NestwatchError::Image(format!("cannot decode snapshot: {}", e)))?
            .to_rgb8();

        debug!(width = image.width(), height = image.height(), "Fetched snapshot");
        Ok(CapturedImage::new(timestamp, image))
    }
}

#[async_trait]
impl FrameSource for HttpSnapshotSource {
    async fn next_image(&mut self) -> Result<Option<CapturedImage>, NestwatchError> {
        self.fetch().await.map(Some)
    }

    /// Try the camera up to `max_retry` times, `retry_wait` apart.
    async fn reconnect(&mut self) -> Result<(), NestwatchError> {
        let mut last_error = None;
        for attempt in 1..=self.max_retry.max(1) {
            match self.fetch().await {
                Ok(_) => {
                    info!(attempt, url = %self.url, "Camera reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, max_retry = self.max_retry, error = %e, "Camera reconnect attempt failed");
                    last_error = Some(e);
                    if attempt < self.max_retry {
                        tokio::time::sleep(self.retry_wait).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| NestwatchError::Capture("reconnect not attempted".into())))
    }

    fn describe(&self) -> String {
        format!("http_snapshot({})", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::ExtendedColorType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn jpeg_bytes() -> Vec<u8> {
        let pixels = vec![90u8; 16 * 12 * 3];
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .encode(&pixels, 16, 12, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    /// Serve `responses` one connection at a time.
    async fn serve(responses: Vec<(u16, Vec<u8>)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(&body).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        format!("http://{}/snapshot.jpg", addr)
    }

    #[tokio::test]
    async fn test_fetches_and_decodes_snapshot() {
        let url = serve(vec![(200, jpeg_bytes())]).await;
        let mut source =
            HttpSnapshotSource::new(url, Duration::from_secs(5), 1, Duration::ZERO).unwrap();
        let captured = source.next_image().await.unwrap().unwrap();
        assert_eq!(captured.image.dimensions(), (16, 12));
    }

    #[tokio::test]
    async fn test_error_status_is_capture_error() {
        let url = serve(vec![(503, Vec::new())]).await;
        let mut source =
            HttpSnapshotSource::new(url, Duration::from_secs(5), 1, Duration::ZERO).unwrap();
        let err = source.next_image().await.unwrap_err();
        assert!(matches!(err, NestwatchError::Capture(_)));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_reconnect_retries_until_success() {
        let url = serve(vec![(500, Vec::new()), (200, jpeg_bytes())]).await;
        let mut source =
            HttpSnapshotSource::new(url, Duration::from_secs(5), 3, Duration::from_millis(10))
                .unwrap();
        source.reconnect().await.unwrap();
    }

    #[test]
    fn test_from_config_requires_url() {
        let config = CameraConfig {
            frame_rate: 5.0,
            source: nestwatch_core::config::SourceKind::HttpSnapshot,
            url: None,
            replay_dir: None,
            stall_factor: 5.0,
            max_retry: 3,
            retry_wait_secs: 2.0,
        };
        assert!(matches!(
            HttpSnapshotSource::from_config(&config),
            Err(NestwatchError::Config(_))
        ));
    }
}
