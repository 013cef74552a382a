//! Nestwatch Capture crate - frame sources, cadence sampling, normalization.
//!
//! Provides the `FrameSource` trait for pulling images from a camera, a
//! `ScriptedSource` for tests, a `FrameSampler` that enforces the target
//! frame rate and reports stalls instead of blocking, plus the image helpers
//! used by motion detection (`Normalizer`) and escalation (`encode_snapshot`).

pub mod http_source;
pub mod normalize;
pub mod replay;
pub mod snapshot;

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::RgbImage;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use nestwatch_core::error::NestwatchError;
use nestwatch_core::types::Frame;

pub use http_source::HttpSnapshotSource;
pub use normalize::Normalizer;
pub use replay::ReplaySource;
pub use snapshot::encode_snapshot;

/// An image as delivered by a source, before sequencing.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub timestamp: DateTime<Utc>,
    pub image: RgbImage,
}

impl CapturedImage {
    pub fn new(timestamp: DateTime<Utc>, image: RgbImage) -> Self {
        Self { timestamp, image }
    }

    /// A single-colour image. Used by tests and demos.
    pub fn solid(timestamp: DateTime<Utc>, width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::new(
            timestamp,
            RgbImage::from_pixel(width, height, image::Rgb(rgb)),
        )
    }
}

/// Pull-based source of camera images.
///
/// `Ok(None)` means the stream has ended. An `Err` means the source lost its
/// connection; the caller may invoke [`FrameSource::reconnect`], whose retry
/// policy belongs to the implementation.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_image(&mut self) -> Result<Option<CapturedImage>, NestwatchError>;

    async fn reconnect(&mut self) -> Result<(), NestwatchError> {
        Ok(())
    }

    /// Human-readable name for logs.
    fn describe(&self) -> String;
}

/// What the sampler produced for one tick.
#[derive(Debug)]
pub enum Sample {
    Frame(Frame),
    /// Nothing arrived within the stall timeout. `timestamp` is the
    /// estimated current time on the source's clock.
    Stalled {
        waited: Duration,
        timestamp: DateTime<Utc>,
    },
    /// The source reported a disconnect.
    Disconnected {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    EndOfStream,
}

/// Counters for one sampling session.
#[derive(Debug, Clone)]
pub struct SamplerStats {
    pub session_id: Uuid,
    pub frames_sampled: u64,
    pub frames_dropped: u64,
    pub stalls: u64,
    pub disconnects: u64,
}

impl SamplerStats {
    fn start() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            frames_sampled: 0,
            frames_dropped: 0,
            stalls: 0,
            disconnects: 0,
        }
    }
}

/// Samples a [`FrameSource`] at a target rate.
///
/// Images closer together than the frame interval are dropped: cadence wins
/// over completeness. When pacing is enabled the sampler also waits for the
/// next interval tick before pulling, which is what polled sources such as
/// HTTP snapshots need.
pub struct FrameSampler {
    source: Box<dyn FrameSource>,
    interval: Duration,
    stall_timeout: Duration,
    pacer: Option<Interval>,
    last_accepted: Option<DateTime<Utc>>,
    /// Monotonic instant at which `last_accepted` was taken.
    accepted_at: Option<Instant>,
    last_observed: Option<DateTime<Utc>>,
    next_sequence: u64,
    stats: SamplerStats,
}

impl FrameSampler {
    pub fn new(source: Box<dyn FrameSource>, interval: Duration, stall_timeout: Duration) -> Self {
        Self {
            source,
            interval,
            stall_timeout,
            pacer: None,
            last_accepted: None,
            accepted_at: None,
            last_observed: None,
            next_sequence: 0,
            stats: SamplerStats::start(),
        }
    }

    /// Wait for each frame interval before pulling from the source.
    pub fn with_pacing(mut self) -> Self {
        let mut pacer = tokio::time::interval(self.interval);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.pacer = Some(pacer);
        self
    }

    pub fn stats(&self) -> &SamplerStats {
        &self.stats
    }

    pub fn describe_source(&self) -> String {
        self.source.describe()
    }

    /// Ask the source to re-establish its connection.
    pub async fn reconnect(&mut self) -> Result<(), NestwatchError> {
        self.source.reconnect().await
    }

    /// Produce the next sampled frame, or a stall / disconnect / end signal.
    pub async fn next_frame(&mut self) -> Sample {
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.tick().await;
        }

        // Allow a little jitter so a source running exactly at the target
        // rate is not decimated.
        let min_spacing = self.interval.mul_f64(0.9);
        let started = Instant::now();
        let deadline = started + self.stall_timeout;

        loop {
            let pulled = tokio::time::timeout_at(deadline, self.source.next_image()).await;
            let captured = match pulled {
                Err(_) => {
                    let waited = started.elapsed();
                    let timestamp = self.source_clock_now();
                    self.stats.stalls += 1;
                    tracing::warn!(
                        waited_ms = waited.as_millis() as u64,
                        source = %self.source.describe(),
                        "Frame source stalled"
                    );
                    return Sample::Stalled { waited, timestamp };
                }
                Ok(Err(e)) => {
                    let timestamp = self.source_clock_now();
                    self.stats.disconnects += 1;
                    tracing::warn!(error = %e, source = %self.source.describe(), "Frame source disconnected");
                    return Sample::Disconnected {
                        reason: e.to_string(),
                        timestamp,
                    };
                }
                Ok(Ok(None)) => {
                    tracing::info!(source = %self.source.describe(), "Frame source reached end of stream");
                    return Sample::EndOfStream;
                }
                Ok(Ok(Some(captured))) => captured,
            };

            if let Some(last) = self.last_accepted {
                let spacing = (captured.timestamp - last).to_std().unwrap_or_default();
                if spacing < min_spacing {
                    self.stats.frames_dropped += 1;
                    tracing::trace!(spacing_ms = spacing.as_millis() as u64, "Dropping frame to hold cadence");
                    continue;
                }
            }

            return Sample::Frame(self.accept(captured));
        }
    }

    fn accept(&mut self, captured: CapturedImage) -> Frame {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.stats.frames_sampled += 1;
        self.last_accepted = Some(captured.timestamp);
        self.accepted_at = Some(Instant::now());
        self.last_observed = Some(captured.timestamp);

        let (width, height) = captured.image.dimensions();
        Frame::new(
            sequence,
            captured.timestamp,
            width,
            height,
            captured.image.into_raw(),
        )
    }

    /// Estimate "now" on the source clock when no frame arrived.
    ///
    /// Measured from the last accepted frame on the monotonic clock, so time
    /// spent reconnecting or waiting on the pacer counts as well. Falls back
    /// to wall time before the first frame. Never goes backwards.
    fn source_clock_now(&mut self) -> DateTime<Utc> {
        let estimate = match (self.last_accepted, self.accepted_at) {
            (Some(stamp), Some(at)) => {
                stamp + chrono::Duration::from_std(at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
            }
            _ => Utc::now(),
        };
        let now = match self.last_observed {
            Some(previous) if previous > estimate => previous,
            _ => estimate,
        };
        self.last_observed = Some(now);
        now
    }
}

// =============================================================================
// Scripted source
// =============================================================================

/// One step of a [`ScriptedSource`].
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Image(CapturedImage),
    /// Never deliver; the sampler will time out.
    Stall,
    Disconnect(String),
}

/// Deterministic source for tests: replays a fixed script, then ends.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    steps: VecDeque<ScriptStep>,
    reconnects: u32,
    reconnect_delay: Duration,
}

impl ScriptedSource {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            reconnects: 0,
            reconnect_delay: Duration::ZERO,
        }
    }

    /// Make every reconnect take `delay`, like a camera that is slow to
    /// come back.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Script made only of images.
    pub fn from_images(images: impl IntoIterator<Item = CapturedImage>) -> Self {
        Self::new(images.into_iter().map(ScriptStep::Image))
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_image(&mut self) -> Result<Option<CapturedImage>, NestwatchError> {
        match self.steps.pop_front() {
            Some(ScriptStep::Image(image)) => Ok(Some(image)),
            Some(ScriptStep::Stall) => std::future::pending().await,
            Some(ScriptStep::Disconnect(reason)) => Err(NestwatchError::Capture(reason)),
            None => Ok(None),
        }
    }

    async fn reconnect(&mut self) -> Result<(), NestwatchError> {
        self.reconnects += 1;
        if !self.reconnect_delay.is_zero() {
            tokio::time::sleep(self.reconnect_delay).await;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("scripted({} steps left)", self.steps.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000 + ms).unwrap()
    }

    fn sampler(steps: Vec<ScriptStep>) -> FrameSampler {
        FrameSampler::new(
            Box::new(ScriptedSource::new(steps)),
            Duration::from_millis(200),
            Duration::from_secs(1),
        )
    }

    fn image(ms: i64) -> ScriptStep {
        ScriptStep::Image(CapturedImage::solid(at_ms(ms), 4, 4, [0, 0, 0]))
    }

    #[tokio::test]
    async fn test_sequences_frames_in_order() {
        let mut s = sampler(vec![image(0), image(200), image(400)]);
        for expected in 0..3u64 {
            match s.next_frame().await {
                Sample::Frame(f) => {
                    assert_eq!(f.sequence, expected);
                    assert!(f.is_well_formed());
                }
                other => panic!("expected frame, got {:?}", other),
            }
        }
        assert!(matches!(s.next_frame().await, Sample::EndOfStream));
        assert_eq!(s.stats().frames_sampled, 3);
    }

    #[tokio::test]
    async fn test_drops_frames_faster_than_cadence() {
        // 30 fps source, 5 fps target.
        let steps: Vec<_> = (0..12).map(|i| image(i * 33)).collect();
        let mut s = sampler(steps);

        let mut accepted = Vec::new();
        while let Sample::Frame(f) = s.next_frame().await {
            accepted.push(f.timestamp);
        }
        assert_eq!(accepted, vec![at_ms(0), at_ms(198)]);
        assert_eq!(s.stats().frames_dropped, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_is_reported_not_blocking() {
        let mut s = sampler(vec![image(0), ScriptStep::Stall, image(5000)]);
        assert!(matches!(s.next_frame().await, Sample::Frame(_)));

        match s.next_frame().await {
            Sample::Stalled { waited, timestamp } => {
                assert!(waited >= Duration::from_secs(1));
                assert!(timestamp >= at_ms(1000));
            }
            other => panic!("expected stall, got {:?}", other),
        }
        assert_eq!(s.stats().stalls, 1);
        assert!(matches!(s.next_frame().await, Sample::Frame(_)));
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect() {
        let mut s = sampler(vec![
            image(0),
            ScriptStep::Disconnect("connection reset".into()),
            image(400),
        ]);
        assert!(matches!(s.next_frame().await, Sample::Frame(_)));
        match s.next_frame().await {
            Sample::Disconnected { reason, .. } => assert!(reason.contains("connection reset")),
            other => panic!("expected disconnect, got {:?}", other),
        }
        s.reconnect().await.unwrap();
        assert!(matches!(s.next_frame().await, Sample::Frame(f) if f.sequence == 1));
        assert_eq!(s.stats().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_clock_counts_reconnect_time() {
        let source = ScriptedSource::new(vec![
            image(0),
            ScriptStep::Disconnect("refused".into()),
            ScriptStep::Disconnect("refused".into()),
            ScriptStep::Disconnect("refused".into()),
        ])
        .with_reconnect_delay(Duration::from_secs(5));
        let mut s = FrameSampler::new(Box::new(source), Duration::from_millis(200), Duration::from_secs(1));
        assert!(matches!(s.next_frame().await, Sample::Frame(_)));

        let mut stamps = Vec::new();
        for _ in 0..3 {
            match s.next_frame().await {
                Sample::Disconnected { timestamp, .. } => stamps.push(timestamp),
                other => panic!("expected disconnect, got {:?}", other),
            }
            s.reconnect().await.unwrap();
        }
        assert_eq!(stamps, vec![at_ms(0), at_ms(5000), at_ms(10_000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_clock_includes_pacer_wait() {
        let mut s = sampler(vec![image(0), ScriptStep::Stall, ScriptStep::Stall]).with_pacing();
        assert!(matches!(s.next_frame().await, Sample::Frame(_)));
        let mut stamps = Vec::new();
        while let Sample::Stalled { timestamp, .. } = s.next_frame().await {
            stamps.push(timestamp);
        }
        assert_eq!(stamps.len(), 2);
        // 200 ms pacer wait, then the 1 s stall timeout.
        assert_eq!(stamps[0], at_ms(1200));
        assert!(stamps[1] >= stamps[0] + chrono::Duration::milliseconds(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_waits_for_interval() {
        let mut s = sampler(vec![image(0), image(200)]).with_pacing();
        let start = Instant::now();
        assert!(matches!(s.next_frame().await, Sample::Frame(_)));
        assert!(matches!(s.next_frame().await, Sample::Frame(_)));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = sampler(vec![]);
        let b = sampler(vec![]);
        assert_ne!(a.stats().session_id, b.stats().session_id);
    }
}
