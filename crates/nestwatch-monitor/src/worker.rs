use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use nestwatch_capture::encode_snapshot;
use nestwatch_classifier::{Classifier, ClassifierError};
use nestwatch_core::config::EscalationConfig;
use nestwatch_core::types::{ClassificationRequest, ClassificationResult};

use crate::gate::Escalation;

/// A request paired with what the classifier made of it.
#[derive(Debug)]
pub struct Completion {
    pub request: ClassificationRequest,
    pub outcome: Result<ClassificationResult, ClassifierError>,
}

/// How escalated frames are shrunk and compressed before classification.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotSettings {
    pub max_side: u32,
    pub quality: u8,
}

impl SnapshotSettings {
    pub fn from_config(config: &EscalationConfig) -> Self {
        Self {
            max_side: config.image_max_size,
            quality: config.image_quality,
        }
    }
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self::from_config(&EscalationConfig::new(0))
    }
}

/// Runs snapshot encoding and classifier calls off the sampling loop.
///
/// The request queue holds a single slot. The escalation gate never has
/// more than one request outstanding, so a full queue means the worker is
/// gone or the gate is misused.
pub struct ClassificationWorker {
    requests: Option<mpsc::Sender<Escalation>>,
    completions: mpsc::Receiver<Completion>,
    task: JoinHandle<()>,
}

impl ClassificationWorker {
    pub fn spawn<C: Classifier + 'static>(classifier: Arc<C>, settings: SnapshotSettings) -> Self {
        let (request_tx, mut request_rx) = mpsc::channel::<Escalation>(1);
        let (completion_tx, completions) = mpsc::channel::<Completion>(4);

        let task = tokio::spawn(async move {
            while let Some(escalation) = request_rx.recv().await {
                let started = Instant::now();
                let completion = match encode(escalation, settings).await {
                    Ok(request) => {
                        let outcome = classifier.classify(&request).await;
                        Completion { request, outcome }
                    }
                    Err(completion) => completion,
                };
                let latency_ms = started.elapsed().as_millis() as u64;

                match &completion.outcome {
                    Ok(result) => debug!(
                        request_id = %completion.request.id,
                        category = %result.category,
                        confidence = result.confidence,
                        latency_ms,
                        "Classification finished"
                    ),
                    Err(e) => warn!(
                        request_id = %completion.request.id,
                        error = %e,
                        latency_ms,
                        "Classification failed"
                    ),
                }

                if completion_tx.send(completion).await.is_err() {
                    break;
                }
            }
        });

        Self {
            requests: Some(request_tx),
            completions,
            task,
        }
    }

    /// Queue an escalation without waiting. Hands it back if the worker
    /// cannot take it.
    pub fn submit(&self, escalation: Escalation) -> Result<(), Escalation> {
        match &self.requests {
            Some(tx) => tx.try_send(escalation).map_err(|e| match e {
                mpsc::error::TrySendError::Full(r) | mpsc::error::TrySendError::Closed(r) => r,
            }),
            None => Err(escalation),
        }
    }

    /// Next completion. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Completion> {
        self.completions.recv().await
    }

    /// Stop taking requests and wait for the worker to wind down.
    pub async fn close(&mut self) {
        self.requests.take();
        self.completions.close();
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!(error = %e, "Classification worker ended abnormally");
            }
        }
    }

    /// Drop whatever the worker is doing.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Resize and JPEG-encode on the blocking pool. A frame that cannot be
/// encoded comes back as a failed completion.
async fn encode(escalation: Escalation, settings: SnapshotSettings) -> Result<ClassificationRequest, Completion> {
    let failed = escalation.unencoded_request();
    let encoded = tokio::task::spawn_blocking(move || {
        encode_snapshot(&escalation.frame, settings.max_side, settings.quality)
            .map(|snapshot| escalation.into_request(snapshot))
    })
    .await;

    let reason = match encoded {
        Ok(Ok(request)) => return Ok(request),
        Ok(Err(e)) => e.to_string(),
        Err(e) => format!("snapshot task failed: {}", e),
    };
    Err(Completion {
        request: failed,
        outcome: Err(ClassifierError::Encoding(reason)),
    })
}
