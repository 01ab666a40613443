use klaxon_core::ValidationError;
use thiserror::Error;

/// Errors surfaced by the silence engine.
#[derive(Debug, Error)]
pub enum SilenceError {
    /// No silence with the given id. Returned, never logged.
    #[error("no silence with id {0}")]
    NotFound(String),

    /// Expiry is monotonic; an expired silence cannot change again.
    #[error("silence {0} has expired and cannot be modified")]
    Expired(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A configured cap was hit. The set is rejected.
    #[error("silence limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
}
