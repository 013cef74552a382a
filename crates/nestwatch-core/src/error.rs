use thiserror::Error;

/// Top-level error type for the Nestwatch system.
///
/// The variants follow the monitor's failure taxonomy. Only `Config` is
/// allowed to stop the process, and only at startup; everything else is
/// isolated to the tick that produced it. Subsystem crates define their own
/// error types and implement `From<SubsystemError> for NestwatchError`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NestwatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Frame source stalled: no frame for {waited_ms} ms")]
    SourceStalled { waited_ms: u64 },

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Classification transport error: {0}")]
    ClassificationTransport(String),

    #[error("Delivery failure ({target}): {reason}")]
    DeliveryFailure { target: String, reason: String },

    #[error("Image error: {0}")]
    Image(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl NestwatchError {
    /// Shorthand for a delivery failure against a named collaborator.
    pub fn delivery(target: &str, reason: impl std::fmt::Display) -> Self {
        NestwatchError::DeliveryFailure {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NestwatchError::Config(_))
    }
}

impl From<toml::de::Error> for NestwatchError {
    fn from(err: toml::de::Error) -> Self {
        NestwatchError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for NestwatchError {
    fn from(err: toml::ser::Error) -> Self {
        NestwatchError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for NestwatchError {
    fn from(err: serde_json::Error) -> Self {
        NestwatchError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Nestwatch operations.
pub type Result<T> = std::result::Result<T, NestwatchError>;
