//! Replays still images from a directory as a camera stream.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use nestwatch_core::config::CameraConfig;
use nestwatch_core::error::NestwatchError;

use crate::{CapturedImage, FrameSource};

const EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Yields each image in the directory once, in file-name order, stamped with
/// the wall clock at read time. Pair with a paced sampler.
pub struct ReplaySource {
    dir: PathBuf,
    queue: VecDeque<PathBuf>,
}

impl ReplaySource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, NestwatchError> {
        let dir = dir.as_ref().to_path_buf();
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(|e| NestwatchError::Capture(format!("cannot read {}: {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        files.sort();

        info!(dir = %dir.display(), images = files.len(), "Replay source opened");
        Ok(Self {
            dir,
            queue: files.into(),
        })
    }

    pub fn from_config(config: &CameraConfig) -> Result<Self, NestwatchError> {
        let dir = config
            .replay_dir
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| NestwatchError::Config("camera.replay_dir is not set".to_string()))?;
        Self::open(dir)
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

#[async_trait]
impl FrameSource for ReplaySource {
    async fn next_image(&mut self) -> Result<Option<CapturedImage>, NestwatchError> {
        let Some(path) = self.queue.pop_front() else {
            return Ok(None);
        };
        debug!(file = %path.display(), "Replaying image");

        let display = path.display().to_string();
        let image = tokio::task::spawn_blocking(move || image::open(&path))
            .await
            .map_err(|e| NestwatchError::Capture(format!("decode task failed: {}", e)))?
            .map_err(|e| NestwatchError::Image(format!("cannot decode {}: {}", display, e)))?
            .to_rgb8();

        Ok(Some(CapturedImage::new(Utc::now(), image)))
    }

    fn describe(&self) -> String {
        format!("replay({})", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_png(dir: &Path, name: &str, shade: u8) {
        RgbImage::from_pixel(6, 4, Rgb([shade, shade, shade]))
            .save(dir.join(name))
            .unwrap();
    }

    #[tokio::test]
    async fn test_replays_images_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "002.png", 20);
        write_png(dir.path(), "001.png", 10);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ReplaySource::open(dir.path()).unwrap();
        assert_eq!(source.remaining(), 2);

        let first = source.next_image().await.unwrap().unwrap();
        assert_eq!(first.image.get_pixel(0, 0).0, [10, 10, 10]);
        let second = source.next_image().await.unwrap().unwrap();
        assert_eq!(second.image.get_pixel(0, 0).0, [20, 20, 20]);
        assert!(source.next_image().await.unwrap().is_none());
    }

    #[test]
    fn test_missing_directory_is_capture_error() {
        let result = ReplaySource::open("/nonexistent/nestwatch-replay");
        assert!(matches!(result, Err(NestwatchError::Capture(_))));
    }
}
