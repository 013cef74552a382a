//! The monitoring loop.
//!
//! One task samples the camera and feeds frames through motion detection,
//! inactivity tracking and the escalation gate. Classification runs on the
//! worker; its completions come back into the same loop, so the gate,
//! router and diary are only ever touched from one place. Alert delivery
//! and digest sending are spawned and never hold up sampling. Diary entries
//! go to the archive through a single writer task, in the order recorded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nestwatch_capture::{FrameSampler, Sample, SamplerStats};
use nestwatch_classifier::{Classifier, ClassifierError, Summarizer};
use nestwatch_core::config::NestwatchConfig;
use nestwatch_core::error::NestwatchError;
use nestwatch_core::events::MonitorEvent;
use nestwatch_core::types::{DangerAlert, DiaryEntry, Frame};
use nestwatch_diary::{DiaryAggregator, DiaryArchive, DigestClock};
use nestwatch_motion::{InactivityTracker, MotionDetector};
use nestwatch_notify::Notifier;

use crate::gate::{Escalation, EscalationGate, GateDecision};
use crate::router::DecisionRouter;
use crate::worker::{ClassificationWorker, Completion, SnapshotSettings};

const EVENT_CAPACITY: usize = 1024;
const SAMPLE_QUEUE: usize = 8;
const DIGEST_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Remote control for a running [`Monitor`].
#[derive(Clone)]
pub struct MonitorHandle {
    shutdown: Arc<Notify>,
    flush: Arc<Notify>,
    events: broadcast::Sender<MonitorEvent>,
}

impl MonitorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Stop sampling, drain outstanding work, and return from `run`.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Flush the diary and send a digest now, outside the daily schedule.
    pub fn flush_digest(&self) {
        self.flush.notify_one();
    }
}

/// What a finished run did.
#[derive(Debug, Clone)]
pub struct MonitorReport {
    pub session_id: Uuid,
    pub frames_sampled: u64,
    pub frames_dropped: u64,
    pub stalls: u64,
    pub disconnects: u64,
    pub requests_dispatched: u64,
    pub alerts_raised: u64,
    pub diary_entries: u64,
    pub digests_sent: u64,
}

/// The assembled pipeline, ready to run.
pub struct Monitor<C: Classifier + 'static> {
    sampler: FrameSampler,
    classifier: Arc<C>,
    notifier: Arc<dyn Notifier>,
    archive: Arc<dyn DiaryArchive>,
    summarizer: Option<Arc<dyn Summarizer>>,
    snapshots: SnapshotSettings,
    detector: MotionDetector,
    tracker: InactivityTracker,
    gate: EscalationGate,
    router: DecisionRouter,
    diary: DiaryAggregator,
    clock: DigestClock,
    shutdown_grace: Duration,
    shutdown: Arc<Notify>,
    flush: Arc<Notify>,
    events: broadcast::Sender<MonitorEvent>,
}

impl<C: Classifier + 'static> Monitor<C> {
    pub fn new(
        config: &NestwatchConfig,
        sampler: FrameSampler,
        classifier: Arc<C>,
        notifier: Arc<dyn Notifier>,
        archive: Arc<dyn DiaryArchive>,
    ) -> Result<Self, NestwatchError> {
        let digest_at = config.diary.digest_time()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            sampler,
            classifier,
            notifier,
            archive,
            summarizer: None,
            snapshots: SnapshotSettings::from_config(&config.escalation),
            detector: MotionDetector::new(&config.motion),
            tracker: InactivityTracker::new(config.danger.stuck_time_threshold()),
            gate: EscalationGate::from_config(config),
            router: DecisionRouter::from_config(config),
            diary: DiaryAggregator::new(config.diary.collapse_window()),
            clock: DigestClock::new(digest_at, Local::now().naive_local()),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            shutdown: Arc::new(Notify::new()),
            flush: Arc::new(Notify::new()),
            events,
        })
    }

    /// Ask `summarizer` for a narrative before each non-empty digest is
    /// sent.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// How long shutdown waits for in-flight classification and deliveries.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            shutdown: Arc::clone(&self.shutdown),
            flush: Arc::clone(&self.flush),
            events: self.events.clone(),
        }
    }

    /// Run until the source ends or shutdown is requested.
    pub async fn run(self) -> MonitorReport {
        let Monitor {
            sampler,
            classifier,
            notifier,
            archive,
            summarizer,
            snapshots,
            detector,
            tracker,
            gate,
            router,
            diary,
            clock,
            shutdown_grace,
            shutdown,
            flush,
            events,
        } = self;

        let session_id = sampler.stats().session_id;
        info!(
            session_id = %session_id,
            source = %sampler.describe_source(),
            "Monitoring started"
        );
        emit(&events, MonitorEvent::MonitoringStarted {
            session_id,
            timestamp: Utc::now(),
        });

        let stop_sampling = Arc::new(Notify::new());
        let (sample_tx, samples) = mpsc::channel(SAMPLE_QUEUE);
        let sampling = tokio::spawn(sample_loop(sampler, sample_tx, Arc::clone(&stop_sampling)));

        let (archive_tx, archive_writer) = spawn_archive_writer(Arc::clone(&archive));

        let mut pipeline = Pipeline {
            worker: ClassificationWorker::spawn(classifier, snapshots),
            notifier,
            archive,
            archive_tx: Some(archive_tx),
            archive_writer: Some(archive_writer),
            summarizer,
            detector,
            tracker,
            gate,
            router,
            diary,
            clock,
            events,
            last_frame: None,
            tasks: Vec::new(),
            requests_dispatched: 0,
            alerts_raised: 0,
            diary_entries: 0,
            digests_sent: 0,
        };

        pipeline.run_loop(samples, &shutdown, &flush).await;

        stop_sampling.notify_one();
        let stats = match sampling.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Sampling task ended abnormally");
                SamplerStats {
                    session_id,
                    frames_sampled: 0,
                    frames_dropped: 0,
                    stalls: 0,
                    disconnects: 0,
                }
            }
        };

        pipeline.drain(Instant::now() + shutdown_grace).await;

        info!(
            session_id = %session_id,
            frames_sampled = stats.frames_sampled,
            requests = pipeline.requests_dispatched,
            alerts = pipeline.alerts_raised,
            "Monitoring stopped"
        );
        emit(&pipeline.events, MonitorEvent::MonitoringStopped {
            session_id,
            frames_sampled: stats.frames_sampled,
            timestamp: Utc::now(),
        });

        MonitorReport {
            session_id,
            frames_sampled: stats.frames_sampled,
            frames_dropped: stats.frames_dropped,
            stalls: stats.stalls,
            disconnects: stats.disconnects,
            requests_dispatched: pipeline.requests_dispatched,
            alerts_raised: pipeline.alerts_raised,
            diary_entries: pipeline.diary_entries,
            digests_sent: pipeline.digests_sent,
        }
    }
}

/// Pull samples until the source ends or `stop` fires. Reconnects after a
/// disconnect before pulling again.
async fn sample_loop(
    mut sampler: FrameSampler,
    samples: mpsc::Sender<Sample>,
    stop: Arc<Notify>,
) -> SamplerStats {
    loop {
        let sample = tokio::select! {
            biased;
            _ = stop.notified() => break,
            sample = sampler.next_frame() => sample,
        };

        let disconnected = matches!(sample, Sample::Disconnected { .. });
        let ended = matches!(sample, Sample::EndOfStream);
        if samples.send(sample).await.is_err() || ended {
            break;
        }

        if disconnected {
            let reconnected = tokio::select! {
                biased;
                _ = stop.notified() => break,
                result = sampler.reconnect() => result,
            };
            if let Err(e) = reconnected {
                warn!(error = %e, source = %sampler.describe_source(), "Reconnect failed");
            }
        }
    }
    sampler.stats().clone()
}

/// Append diary entries one at a time, in the order they were recorded.
fn spawn_archive_writer(archive: Arc<dyn DiaryArchive>) -> (mpsc::UnboundedSender<DiaryEntry>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<DiaryEntry>();
    let task = tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            if let Err(e) = archive.append(&entry).await {
                error!(entry_id = %entry.id, error = %e, "Diary archive append failed");
            }
        }
    });
    (tx, task)
}

enum Step {
    Shutdown,
    Flush,
    Completed(Completion),
    Sampled(Sample),
    SourceGone,
    CheckDigest,
}

/// Loop-owned state.
struct Pipeline {
    worker: ClassificationWorker,
    notifier: Arc<dyn Notifier>,
    archive: Arc<dyn DiaryArchive>,
    /// Feeds the archive writer. Dropped on drain to let it finish.
    archive_tx: Option<mpsc::UnboundedSender<DiaryEntry>>,
    archive_writer: Option<JoinHandle<()>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    detector: MotionDetector,
    tracker: InactivityTracker,
    gate: EscalationGate,
    router: DecisionRouter,
    diary: DiaryAggregator,
    clock: DigestClock,
    events: broadcast::Sender<MonitorEvent>,
    /// Most recent well-formed frame, used when a trigger fires on a tick
    /// without one.
    last_frame: Option<Frame>,
    tasks: Vec<JoinHandle<()>>,
    requests_dispatched: u64,
    alerts_raised: u64,
    diary_entries: u64,
    digests_sent: u64,
}

impl Pipeline {
    async fn run_loop(
        &mut self,
        mut samples: mpsc::Receiver<Sample>,
        shutdown: &Notify,
        flush: &Notify,
    ) {
        let mut digest_check = tokio::time::interval(DIGEST_CHECK_INTERVAL);
        digest_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                biased;
                _ = shutdown.notified() => Step::Shutdown,
                _ = flush.notified() => Step::Flush,
                Some(completion) = self.worker.recv() => Step::Completed(completion),
                sample = samples.recv() => match sample {
                    Some(sample) => Step::Sampled(sample),
                    None => Step::SourceGone,
                },
                _ = digest_check.tick() => Step::CheckDigest,
            };

            match step {
                Step::Shutdown => {
                    info!("Shutdown requested");
                    return;
                }
                Step::Flush => {
                    let today = Local::now().date_naive();
                    self.send_digest(today);
                }
                Step::Completed(completion) => self.complete_and_follow(completion),
                Step::Sampled(Sample::EndOfStream) | Step::SourceGone => return,
                Step::Sampled(sample) => {
                    self.on_sample(sample);
                    self.check_digest();
                }
                Step::CheckDigest => self.check_digest(),
            }
        }
    }

    fn on_sample(&mut self, sample: Sample) {
        match sample {
            Sample::Frame(frame) => self.on_frame(frame),
            Sample::Stalled { timestamp, .. } => {
                emit(&self.events, MonitorEvent::SourceStalled { timestamp });
                self.on_still_tick(timestamp);
            }
            Sample::Disconnected { reason, timestamp } => {
                debug!(reason = %reason, "Treating disconnect as a still tick");
                self.detector.reset();
                self.on_still_tick(timestamp);
            }
            Sample::EndOfStream => {}
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        let event = match self.detector.detect(&frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(sequence = frame.sequence, error = %e, "Skipping unusable frame");
                self.on_still_tick(frame.timestamp);
                return;
            }
        };

        if event.is_motion {
            emit(&self.events, MonitorEvent::MotionDetected {
                sequence: event.sequence,
                changed_area: event.changed_area,
                timestamp: event.timestamp,
            });
        }

        let stuck = self.tracker.update(&event).is_some();
        if stuck {
            self.emit_stuck(event.timestamp);
        }

        let timestamp = frame.timestamp;
        self.last_frame = Some(frame);
        self.escalate(event.is_motion, stuck, timestamp);
    }

    fn on_still_tick(&mut self, timestamp: DateTime<Utc>) {
        let stuck = self.tracker.observe_still(timestamp).is_some();
        if stuck {
            self.emit_stuck(timestamp);
        }
        self.escalate(false, stuck, timestamp);
    }

    fn emit_stuck(&self, timestamp: DateTime<Utc>) {
        emit(&self.events, MonitorEvent::StuckTransition {
            still_secs: self.tracker.state().elapsed_still.as_secs(),
            timestamp,
        });
    }

    fn escalate(&mut self, is_motion: bool, stuck: bool, now: DateTime<Utc>) {
        match self.gate.on_tick(self.last_frame.as_ref(), is_motion, stuck, now) {
            GateDecision::Idle | GateDecision::NoFrame(_) => {}
            GateDecision::Dispatch(escalation) => self.submit(escalation),
            GateDecision::Coalesced { reason, sequence } => {
                debug!(reason = %reason, sequence, "Trigger held behind in-flight request");
                emit(&self.events, MonitorEvent::ClassificationCoalesced {
                    reason,
                    sequence,
                    timestamp: now,
                });
            }
        }
    }

    /// Hand escalations to the worker. One the worker cannot take is
    /// completed on the spot as a transport failure, which may release the
    /// pending follow-up.
    fn submit(&mut self, escalation: Escalation) {
        let mut next = Some(escalation);
        while let Some(escalation) = next.take() {
            self.requests_dispatched += 1;
            info!(
                request_id = %escalation.id,
                reason = %escalation.reason,
                sequence = escalation.sequence(),
                "Classification requested"
            );
            emit(&self.events, MonitorEvent::ClassificationRequested {
                request_id: escalation.id,
                reason: escalation.reason,
                sequence: escalation.sequence(),
                timestamp: escalation.timestamp(),
            });

            if let Err(escalation) = self.worker.submit(escalation) {
                error!(request_id = %escalation.id, "Classification worker unavailable");
                next = self.complete(Completion {
                    request: escalation.unencoded_request(),
                    outcome: Err(ClassifierError::Transport("classification worker unavailable".into())),
                });
            }
        }
    }

    fn complete_and_follow(&mut self, completion: Completion) {
        if let Some(follow_up) = self.complete(completion) {
            self.submit(follow_up);
        }
    }

    fn complete(&mut self, completion: Completion) -> Option<Escalation> {
        let (result, follow_up) = self.gate.on_result(completion);

        info!(
            request_id = %result.request_id,
            category = %result.category,
            original = %result.original_category,
            confidence = result.confidence,
            failed = result.failed,
            "Classification completed"
        );
        emit(&self.events, MonitorEvent::ClassificationCompleted {
            request_id: result.request_id,
            reason: result.reason,
            category: result.category,
            original_category: result.original_category,
            confidence: result.confidence,
            failed: result.failed,
            timestamp: result.completed_at,
        });

        let routing = self.router.route(&result);
        if let Some(alert) = routing.alert {
            self.raise_alert(alert);
        }
        self.record(routing.diary);

        follow_up
    }

    fn raise_alert(&mut self, alert: DangerAlert) {
        self.alerts_raised += 1;
        warn!(
            alert_id = %alert.id,
            category = %alert.category,
            confidence = alert.confidence,
            superseded = alert.superseded,
            "Danger alert raised"
        );
        emit(&self.events, MonitorEvent::AlertRaised {
            alert_id: alert.id,
            category: alert.category,
            confidence: alert.confidence,
            superseded: alert.superseded,
            timestamp: alert.timestamp,
        });

        let notifier = Arc::clone(&self.notifier);
        let events = self.events.clone();
        self.spawn(async move {
            if let Err(e) = notifier.send_alert(&alert).await {
                error!(
                    alert_id = %alert.id,
                    notifier = notifier.name(),
                    error = %e,
                    "Alert delivery failed"
                );
                emit(&events, MonitorEvent::AlertDeliveryFailed {
                    alert_id: alert.id,
                    reason: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        });
    }

    fn record(&mut self, entry: DiaryEntry) {
        let queued = match &self.archive_tx {
            Some(tx) => tx.send(entry.clone()).is_ok(),
            None => false,
        };
        if !queued {
            error!(entry_id = %entry.id, "Diary archive writer is gone, entry kept in memory only");
        }

        let category = entry.category;
        let timestamp = entry.timestamp;
        let appended = self.diary.append(entry);
        self.diary_entries += 1;
        emit(&self.events, MonitorEvent::DiaryRecorded {
            entry_id: appended.entry_id(),
            category,
            collapsed: appended.is_collapsed(),
            timestamp,
        });
    }

    fn check_digest(&mut self) {
        if let Some(day) = self.clock.due(Local::now().naive_local()) {
            self.clock.mark_fired(day);
            self.send_digest(day);
        }
    }

    fn send_digest(&mut self, day: NaiveDate) {
        let digest = self.diary.flush(day);
        self.digests_sent += 1;
        emit(&self.events, MonitorEvent::DigestFlushed {
            day,
            entry_count: digest.entries.len(),
            timestamp: digest.generated_at,
        });

        let notifier = Arc::clone(&self.notifier);
        let archive = Arc::clone(&self.archive);
        let summarizer = self.summarizer.clone();
        self.spawn(async move {
            let mut digest = digest;
            if let Some(summarizer) = summarizer.filter(|_| !digest.is_empty()) {
                match summarizer.summarize(&digest).await {
                    Ok(summary) => digest.summary = Some(summary),
                    Err(e) => warn!(
                        day = %digest.day,
                        summarizer = summarizer.name(),
                        error = %e,
                        "Digest summary unavailable, sending entries only"
                    ),
                }
            }
            if let Err(e) = archive.store_digest(&digest).await {
                error!(day = %digest.day, error = %e, "Digest archive failed");
            }
            if let Err(e) = notifier.send_digest(&digest).await {
                error!(day = %digest.day, notifier = notifier.name(), error = %e, "Digest delivery failed");
            }
        });
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    /// Wait, up to `deadline`, for the in-flight request (and any follow-up
    /// it releases), for spawned deliveries and for the archive writer.
    async fn drain(&mut self, deadline: Instant) {
        while self.gate.in_flight() {
            match tokio::time::timeout_at(deadline, self.worker.recv()).await {
                Ok(Some(completion)) => self.complete_and_follow(completion),
                Ok(None) => break,
                Err(_) => {
                    warn!("Shutdown grace elapsed with a classification still in flight");
                    break;
                }
            }
        }

        if tokio::time::timeout_at(deadline, self.worker.close()).await.is_err() {
            self.worker.abort();
        }

        for task in std::mem::take(&mut self.tasks) {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                warn!("Shutdown grace elapsed before deliveries finished");
                break;
            }
        }

        self.archive_tx.take();
        if let Some(mut writer) = self.archive_writer.take() {
            if tokio::time::timeout_at(deadline, &mut writer).await.is_err() {
                warn!("Shutdown grace elapsed before the diary archive caught up");
                writer.abort();
            }
        }
    }
}

fn emit(events: &broadcast::Sender<MonitorEvent>, event: MonitorEvent) {
    debug!(event = event.kind(), "Monitor event");
    // No subscribers is fine.
    let _ = events.send(event);
}
