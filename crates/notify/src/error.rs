use std::time::Duration;

use thiserror::Error;

/// Errors an integration can return from a send attempt.
///
/// Retryability drives the retry stage: transient transport failures are
/// retried within the flush's time budget, rejections abort the flush so
/// the notification log is not advanced.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by receiver")]
    RateLimited,

    /// A 4xx-style rejection: bad credentials, bad payload, gone target.
    #[error("rejected by receiver: {0}")]
    Rejected(String),
}

impl IntegrationError {
    /// Whether the retry stage should try this send again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::RateLimited => true,
            Self::Rejected(_) => false,
        }
    }
}

/// Errors surfaced by a pipeline flush.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// An integration rejected the notification permanently.
    #[error("integration {integration:?} failed permanently: {source}")]
    Integration {
        integration: String,
        #[source]
        source: IntegrationError,
    },

    /// The send was still failing when the flush's time budget ran out;
    /// the next flush will retry from scratch.
    #[error("integration {integration:?} still failing at the flush deadline")]
    Timeout { integration: String },

    /// The flush context names a receiver the pipeline was not built
    /// with.
    #[error("no integrations configured for receiver {0:?}")]
    UnknownReceiver(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_split() {
        assert!(IntegrationError::Connection("refused".into()).is_retryable());
        assert!(IntegrationError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(IntegrationError::RateLimited.is_retryable());
        assert!(!IntegrationError::Rejected("401".into()).is_retryable());
    }
}
