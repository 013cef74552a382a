//! Nestwatch Motion crate - frame differencing and inactivity tracking.
//!
//! `MotionDetector` turns consecutive frames into `MotionEvent`s.
//! `InactivityState` folds those events into "how long has it been still"
//! and raises a one-shot `StuckTransition` when stillness crosses the
//! configured threshold.

pub mod detector;
pub mod inactivity;

pub use detector::{changed_area, MotionDetector};
pub use inactivity::{InactivityState, InactivityTracker, StuckTransition};
