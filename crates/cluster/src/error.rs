use thiserror::Error;

/// Errors surfaced by the cluster layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to join cluster: {0}")]
    Join(String),

    #[error("gossip channel {0:?} is already registered")]
    DuplicateChannel(String),
}
