//! Error types for the detailed classifier.

use nestwatch_core::error::NestwatchError;

/// Errors from a classification attempt.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("classifier returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed classifier response: {reason}")]
    MalformedResponse { reason: String, raw: String },
    #[error("classifier timed out after {0} ms")]
    Timeout(u64),
    #[error("cannot encode request: {0}")]
    Encoding(String),
}

impl ClassifierError {
    /// Worth another attempt: network trouble, timeouts, server-side errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClassifierError::Transport(_) | ClassifierError::Timeout(_) => true,
            ClassifierError::Status { status, .. } => *status >= 500 || *status == 429,
            ClassifierError::MalformedResponse { .. } | ClassifierError::Encoding(_) => false,
        }
    }

    /// Raw response text, when the service answered with something
    /// unusable.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            ClassifierError::MalformedResponse { raw, .. } => Some(raw),
            ClassifierError::Status { body, .. } => Some(body),
            _ => None,
        }
    }
}

impl From<ClassifierError> for NestwatchError {
    fn from(err: ClassifierError) -> Self {
        NestwatchError::ClassificationTransport(err.to_string())
    }
}
