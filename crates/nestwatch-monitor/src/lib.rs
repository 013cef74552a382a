//! Nestwatch Monitor crate - the monitoring pipeline.
//!
//! Ties sampling, motion detection and inactivity tracking to the
//! `EscalationGate`, encodes and classifies on a `ClassificationWorker`, maps
//! results through the `DecisionRouter` to alerts and the diary, and sends
//! the daily digest. `Monitor` owns the loop; `MonitorHandle` controls it
//! from outside.

pub mod gate;
pub mod pipeline;
pub mod router;
pub mod worker;

pub use gate::{Escalation, EscalationGate, GateDecision, GatedResult};
pub use pipeline::{Monitor, MonitorHandle, MonitorReport};
pub use router::{DecisionRouter, Routing};
pub use worker::{ClassificationWorker, Completion, SnapshotSettings};
