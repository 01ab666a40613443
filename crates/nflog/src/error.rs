use thiserror::Error;

/// Errors surfaced by the notification log.
#[derive(Debug, Error)]
pub enum NflogError {
    /// No entry for the queried (group key, receiver). Returned, never
    /// logged.
    #[error("no log entry for group {group_key:?} and receiver {receiver:?}")]
    NotFound { group_key: String, receiver: String },

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
}
