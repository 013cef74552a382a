use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, ImageBuffer, Rgb, RgbImage};

use nestwatch_core::error::NestwatchError;
use nestwatch_core::types::{Frame, Snapshot};

/// Encode a frame as JPEG, shrinking it so neither side exceeds `max_side`.
///
/// CPU-bound. Async callers run it with `tokio::task::spawn_blocking`.
pub fn encode_snapshot(frame: &Frame, max_side: u32, quality: u8) -> Result<Snapshot, NestwatchError> {
    let rgb: RgbImage = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(
        frame.width,
        frame.height,
        frame.pixels.clone(),
    )
    .ok_or_else(|| {
        NestwatchError::Image(format!(
            "cannot snapshot frame {}: buffer does not match {}x{}",
            frame.sequence, frame.width, frame.height
        ))
    })?;

    let (width, height) = fit_within(frame.width, frame.height, max_side);
    let rgb = if (width, height) == (frame.width, frame.height) {
        rgb
    } else {
        imageops::resize(&rgb, width, height, FilterType::Triangle)
    };

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
        .map_err(|e| NestwatchError::Image(format!("jpeg encode failed: {}", e)))?;

    tracing::trace!(
        sequence = frame.sequence,
        width,
        height,
        bytes = jpeg.len(),
        "Encoded snapshot"
    );

    Ok(Snapshot {
        frame_sequence: frame.sequence,
        captured_at: frame.timestamp,
        width,
        height,
        jpeg: Arc::new(jpeg),
    })
}

/// Scale `(width, height)` down, preserving aspect ratio, so the longer side
/// is at most `max_side`.
fn fit_within(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if max_side == 0 || longest <= max_side {
        return (width, height);
    }
    let scale = max_side as f64 / longest as f64;
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_fit_within() {
        assert_eq!(fit_within(640, 480, 1024), (640, 480));
        assert_eq!(fit_within(2048, 1536, 1024), (1024, 768));
        assert_eq!(fit_within(1080, 1920, 1024), (576, 1024));
        assert_eq!(fit_within(300, 200, 0), (300, 200));
    }

    #[test]
    fn test_encode_produces_jpeg() {
        let frame = Frame::solid(9, Utc::now(), 64, 48, [120, 60, 30]);
        let snapshot = encode_snapshot(&frame, 1024, 85).unwrap();
        assert_eq!(snapshot.frame_sequence, 9);
        assert_eq!(snapshot.captured_at, frame.timestamp);
        assert_eq!((snapshot.width, snapshot.height), (64, 48));
        assert_eq!(&snapshot.jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&snapshot.jpeg).unwrap();
        assert_eq!(decoded.width(), 64);
    }

    #[test]
    fn test_encode_resizes_large_frames() {
        let frame = Frame::solid(0, Utc::now(), 200, 100, [0, 0, 0]);
        let snapshot = encode_snapshot(&frame, 50, 85).unwrap();
        assert_eq!((snapshot.width, snapshot.height), (50, 25));
    }

    #[test]
    fn test_encode_rejects_malformed_frame() {
        let frame = Frame::new(0, Utc::now(), 10, 10, vec![1, 2, 3]);
        assert!(matches!(
            encode_snapshot(&frame, 1024, 85),
            Err(NestwatchError::Image(_))
        ));
    }
}
