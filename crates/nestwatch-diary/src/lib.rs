//! Nestwatch Diary crate - the running activity diary and its daily digest.
//!
//! `DiaryAggregator` accumulates entries for the current day and produces a
//! `DailyDigest` on flush. `DigestClock` decides when a flush is due.
//! `DiaryArchive` persists entries and digests as they happen.

pub mod aggregator;
pub mod archive;
pub mod clock;

pub use aggregator::{local_midday, select_representative, Appended, DiaryAggregator};
pub use archive::{DiaryArchive, JsonlArchive, MemoryArchive};
pub use clock::DigestClock;
