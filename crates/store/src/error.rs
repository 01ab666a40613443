use klaxon_core::{Fingerprint, ValidationError};
use thiserror::Error;

/// Errors surfaced by the alert store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No alert with the given fingerprint. Returned, never logged.
    #[error("no alert with fingerprint {0}")]
    NotFound(Fingerprint),

    /// The ingested alert failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
