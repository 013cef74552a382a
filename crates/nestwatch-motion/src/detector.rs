use image::GrayImage;
use tracing::{debug, trace};

use nestwatch_capture::Normalizer;
use nestwatch_core::config::MotionConfig;
use nestwatch_core::error::NestwatchError;
use nestwatch_core::types::{Frame, MotionEvent};

/// Count pixels whose luma differs by at least `pixel_delta`.
///
/// Both images must have the same dimensions; the caller guarantees this.
pub fn changed_area(previous: &GrayImage, current: &GrayImage, pixel_delta: u8) -> u64 {
    previous
        .as_raw()
        .iter()
        .zip(current.as_raw().iter())
        .filter(|(a, b)| a.abs_diff(**b) >= pixel_delta)
        .count() as u64
}

/// Compares each frame with the previous one.
///
/// Holds only the normalized previous frame. The first frame, and any frame
/// whose dimensions differ from the previous one, reseeds the detector and
/// yields a neutral event.
pub struct MotionDetector {
    normalizer: Normalizer,
    motion_threshold: u64,
    pixel_delta: u8,
    previous: Option<GrayImage>,
}

impl MotionDetector {
    pub fn new(config: &MotionConfig) -> Self {
        Self {
            normalizer: Normalizer::from_config(config),
            motion_threshold: config.motion_threshold,
            pixel_delta: config.pixel_delta_threshold,
            previous: None,
        }
    }

    pub fn motion_threshold(&self) -> u64 {
        self.motion_threshold
    }

    /// Forget the previous frame, e.g. after a source reconnect.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<MotionEvent, NestwatchError> {
        let current = self.normalizer.normalize(frame)?;

        let event = match self.previous.as_ref() {
            Some(previous) if previous.dimensions() == current.dimensions() => {
                let area = changed_area(previous, &current, self.pixel_delta);
                MotionEvent::from_area(frame.timestamp, frame.sequence, area, self.motion_threshold)
            }
            Some(previous) => {
                debug!(
                    sequence = frame.sequence,
                    from = ?previous.dimensions(),
                    to = ?current.dimensions(),
                    "Frame size changed, reseeding motion detector"
                );
                MotionEvent::still(frame.timestamp, frame.sequence)
            }
            None => MotionEvent::still(frame.timestamp, frame.sequence),
        };

        trace!(
            sequence = event.sequence,
            changed_area = event.changed_area,
            is_motion = event.is_motion,
            "Motion compared"
        );
        self.previous = Some(current);
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use image::Luma;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn config(threshold: u64) -> MotionConfig {
        MotionConfig {
            blur_sigma: 0.0,
            ..MotionConfig::new(threshold)
        }
    }

    /// A black 100x100 frame with the top `rows` rows white.
    fn frame_with_white_rows(sequence: u64, rows: u32) -> Frame {
        let (w, h) = (100u32, 100u32);
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            let v = if y < rows { 255 } else { 0 };
            for _ in 0..w {
                pixels.extend_from_slice(&[v, v, v]);
            }
        }
        Frame::new(sequence, ts(sequence as i64), w, h, pixels)
    }

    #[test]
    fn test_changed_area_counts_pixels_over_delta() {
        let a = GrayImage::from_pixel(4, 4, Luma([100]));
        let mut b = a.clone();
        b.put_pixel(0, 0, Luma([130]));
        b.put_pixel(1, 0, Luma([129]));
        b.put_pixel(2, 0, Luma([60]));
        assert_eq!(changed_area(&a, &b, 30), 2);
        assert_eq!(changed_area(&a, &a, 30), 0);
    }

    #[test]
    fn test_first_frame_is_neutral() {
        let mut detector = MotionDetector::new(&config(10));
        let event = detector.detect(&frame_with_white_rows(0, 50)).unwrap();
        assert_eq!(event.changed_area, 0);
        assert!(!event.is_motion);
    }

    #[test]
    fn test_identical_frames_have_zero_area() {
        let mut detector = MotionDetector::new(&config(10));
        detector.detect(&frame_with_white_rows(0, 30)).unwrap();
        let event = detector.detect(&frame_with_white_rows(1, 30)).unwrap();
        assert_eq!(event.changed_area, 0);
        assert!(!event.is_motion);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        // 50 rows of 100 pixels change between frames.
        let mut detector = MotionDetector::new(&config(5000));
        detector.detect(&frame_with_white_rows(0, 0)).unwrap();
        let event = detector.detect(&frame_with_white_rows(1, 50)).unwrap();
        assert_eq!(event.changed_area, 5000);
        assert!(event.is_motion);

        let mut detector = MotionDetector::new(&config(5001));
        detector.detect(&frame_with_white_rows(0, 0)).unwrap();
        let event = detector.detect(&frame_with_white_rows(1, 50)).unwrap();
        assert!(!event.is_motion);
    }

    #[test]
    fn test_area_below_threshold_is_not_motion() {
        let mut detector = MotionDetector::new(&config(5000));
        detector.detect(&frame_with_white_rows(0, 0)).unwrap();
        let event = detector.detect(&frame_with_white_rows(1, 40)).unwrap();
        assert_eq!(event.changed_area, 4000);
        assert!(!event.is_motion);
    }

    #[test]
    fn test_resolution_change_reseeds() {
        let mut detector = MotionDetector::new(&config(1));
        detector.detect(&frame_with_white_rows(0, 0)).unwrap();
        let small = Frame::solid(1, ts(1), 10, 10, [255, 255, 255]);
        let event = detector.detect(&small).unwrap();
        assert!(!event.is_motion);

        let again = Frame::solid(2, ts(2), 10, 10, [0, 0, 0]);
        let event = detector.detect(&again).unwrap();
        assert_eq!(event.changed_area, 100);
        assert!(event.is_motion);
    }

    #[test]
    fn test_malformed_frame_keeps_previous() {
        let mut detector = MotionDetector::new(&config(1));
        detector.detect(&frame_with_white_rows(0, 0)).unwrap();
        let broken = Frame::new(1, ts(1), 100, 100, vec![0; 3]);
        assert!(detector.detect(&broken).is_err());
        let event = detector.detect(&frame_with_white_rows(2, 10)).unwrap();
        assert_eq!(event.changed_area, 1000);
    }
}
