//! Frame normalization ahead of motion differencing.

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Rgb};

use nestwatch_core::config::MotionConfig;
use nestwatch_core::error::NestwatchError;
use nestwatch_core::types::Frame;

/// Converts frames to blurred grayscale at a fixed analysis resolution.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    analysis_width: u32,
    blur_sigma: f32,
}

impl Normalizer {
    /// `analysis_width` of 0 keeps the native resolution; a `blur_sigma`
    /// of 0 skips the blur.
    pub fn new(analysis_width: u32, blur_sigma: f32) -> Self {
        Self {
            analysis_width,
            blur_sigma,
        }
    }

    pub fn from_config(config: &MotionConfig) -> Self {
        Self::new(config.analysis_width, config.blur_sigma)
    }

    pub fn normalize(&self, frame: &Frame) -> Result<GrayImage, NestwatchError> {
        let rgb = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(
            frame.width,
            frame.height,
            frame.pixels.as_slice(),
        )
        .ok_or_else(|| {
            NestwatchError::Image(format!(
                "frame {} has {} bytes for {}x{}",
                frame.sequence,
                frame.pixels.len(),
                frame.width,
                frame.height
            ))
        })?;

        let mut gray = imageops::grayscale(&rgb);

        if self.analysis_width > 0 && gray.width() > self.analysis_width {
            let height = scaled_height(gray.width(), gray.height(), self.analysis_width);
            gray = imageops::resize(&gray, self.analysis_width, height, FilterType::Triangle);
        }

        if self.blur_sigma > 0.0 {
            gray = imageops::blur(&gray, self.blur_sigma);
        }

        Ok(gray)
    }
}

fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    let scaled = (height as u64 * target_width as u64) / width.max(1) as u64;
    scaled.max(1) as u32
}
