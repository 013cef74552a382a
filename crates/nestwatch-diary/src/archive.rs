//! Durable storage for diary entries and digests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use nestwatch_core::error::NestwatchError;
use nestwatch_core::types::{DailyDigest, DiaryEntry, Snapshot};

/// Append-only diary store. Failures are reported, never retried here.
#[async_trait]
pub trait DiaryArchive: Send + Sync {
    async fn append(&self, entry: &DiaryEntry) -> Result<(), NestwatchError>;

    async fn store_digest(&self, digest: &DailyDigest) -> Result<(), NestwatchError>;
}

// =============================================================================
// JSON Lines archive
// =============================================================================

/// Stores each local day as `diary-YYYY-MM-DD.jsonl`, snapshots under
/// `images/`, and digests as `digest-YYYY-MM-DD.json`.
///
/// A collapsed run is archived once per observation, so the file holds every
/// classification even when the in-memory diary folded them.
#[derive(Debug, Clone)]
pub struct JsonlArchive {
    dir: PathBuf,
}

impl JsonlArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn day_file(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("diary-{}.jsonl", day.format("%Y-%m-%d")))
    }

    pub fn digest_file(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("digest-{}.json", day.format("%Y-%m-%d")))
    }

    fn images_dir(&self) -> PathBuf {
        self.dir.join("images")
    }

    /// Read back one day's archived entries in append order.
    pub async fn read_day(&self, day: NaiveDate) -> Result<Vec<DiaryEntry>, NestwatchError> {
        let path = self.day_file(day);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(NestwatchError::from))
            .collect()
    }

    async fn write_image(&self, snapshot: &Snapshot, name: &str) -> Result<PathBuf, NestwatchError> {
        let dir = self.images_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, snapshot.jpeg.as_slice()).await?;
        Ok(path)
    }
}

#[async_trait]
impl DiaryArchive for JsonlArchive {
    async fn append(&self, entry: &DiaryEntry) -> Result<(), NestwatchError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        if let Some(snapshot) = entry.image.as_ref().filter(|s| !s.is_empty()) {
            self.write_image(snapshot, &snapshot.file_name()).await?;
        }

        let day = entry.timestamp.with_timezone(&Local).date_naive();
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let path = self.day_file(day);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(entry_id = %entry.id, file = %path.display(), "Diary entry archived");
        Ok(())
    }

    async fn store_digest(&self, digest: &DailyDigest) -> Result<(), NestwatchError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        if let Some(snapshot) = digest
            .representative
            .as_ref()
            .and_then(|e| e.image.as_ref())
            .filter(|s| !s.is_empty())
        {
            let name = format!("digest-{}.jpg", digest.day.format("%Y-%m-%d"));
            self.write_image(snapshot, &name).await?;
        }

        let path = self.digest_file(digest.day);
        let json = serde_json::to_string_pretty(digest)?;
        tokio::fs::write(&path, json).await?;
        debug!(day = %digest.day, file = %path.display(), "Digest archived");
        Ok(())
    }
}

// =============================================================================
// In-memory archive
// =============================================================================

/// Keeps everything in memory. Can be switched to fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    entries: Arc<Mutex<Vec<DiaryEntry>>>,
    digests: Arc<Mutex<Vec<DailyDigest>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<DiaryEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn digests(&self) -> Vec<DailyDigest> {
        self.digests.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), NestwatchError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(NestwatchError::delivery("archive", "archive unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DiaryArchive for MemoryArchive {
    async fn append(&self, entry: &DiaryEntry) -> Result<(), NestwatchError> {
        self.check()?;
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.clone());
        }
        Ok(())
    }

    async fn store_digest(&self, digest: &DailyDigest) -> Result<(), NestwatchError> {
        self.check()?;
        if let Ok(mut digests) = self.digests.lock() {
            digests.push(digest.clone());
        }
        Ok(())
    }
}
