pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::NestwatchConfig;
pub use error::{NestwatchError, Result};
pub use events::MonitorEvent;
pub use types::*;
