//! The peer abstraction and the clusterless implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ClusterError;

/// State a component exposes to the gossip layer.
///
/// `merge` must be commutative and idempotent: peers exchange full state
/// in arbitrary order and may deliver the same payload repeatedly.
pub trait GossipState: Send + Sync + 'static {
    /// Serialize the component's current full state.
    fn full_state(&self) -> Vec<u8>;

    /// Fold remote state into the local state.
    fn merge(&self, remote: &[u8]);
}

/// Handle a component uses to announce that its state changed.
///
/// Cheap to clone; `notify` never blocks. On a clusterless peer this is a
/// no-op.
#[derive(Clone, Default, Debug)]
pub struct Broadcast {
    tx: Option<mpsc::UnboundedSender<()>>,
}

impl Broadcast {
    /// A broadcast handle that discards notifications.
    #[must_use]
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub(crate) fn new(tx: mpsc::UnboundedSender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Request that the channel's state be re-published to peers.
    pub fn notify(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(());
        }
    }
}

/// A member of the notification cluster.
#[async_trait]
pub trait Peer: Send + Sync {
    /// The stable name of this peer.
    fn name(&self) -> &str;

    /// This peer's index in the lexicographically sorted list of live
    /// peer names. Position 0 sends first; higher positions wait.
    async fn position(&self) -> usize;

    /// Block until the expected number of peers are visible or the
    /// timeout elapses. Called before dispatch starts ingesting so the
    /// first notifications already consider peer state.
    async fn settle(&self, timeout: Duration);

    /// Register a gossip channel. Returns the broadcast handle the
    /// component calls after local mutations.
    async fn register(
        &self,
        channel: &str,
        state: Arc<dyn GossipState>,
    ) -> Result<Broadcast, ClusterError>;
}

/// Compute a peer's position among the live peer names.
///
/// Unknown names sort to position 0 so a peer that cannot see itself yet
/// does not delay sends.
#[must_use]
pub fn position_of(name: &str, live: &mut Vec<String>) -> usize {
    live.sort_unstable();
    live.dedup();
    live.iter().position(|n| n == name).unwrap_or(0)
}

/// The clusterless peer: a single instance with no replication.
///
/// Position is always 0, settling is immediate, and broadcasts go
/// nowhere. This is the default when no seeds are configured.
pub struct LocalPeer {
    name: String,
}

impl LocalPeer {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LocalPeer {
    fn default() -> Self {
        Self::new("local")
    }
}

#[async_trait]
impl Peer for LocalPeer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn position(&self) -> usize {
        0
    }

    async fn settle(&self, _timeout: Duration) {}

    async fn register(
        &self,
        _channel: &str,
        _state: Arc<dyn GossipState>,
    ) -> Result<Broadcast, ClusterError> {
        Ok(Broadcast::noop())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingState(AtomicUsize);

    impl GossipState for CountingState {
        fn full_state(&self) -> Vec<u8> {
            Vec::new()
        }

        fn merge(&self, _remote: &[u8]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn position_is_sorted_index() {
        let mut live = vec!["charlie".into(), "alpha".into(), "bravo".into()];
        assert_eq!(position_of("alpha", &mut live.clone()), 0);
        assert_eq!(position_of("bravo", &mut live.clone()), 1);
        assert_eq!(position_of("charlie", &mut live), 2);
    }

    #[test]
    fn position_dedups_and_defaults_to_zero() {
        let mut live = vec!["a".into(), "a".into(), "b".into()];
        assert_eq!(position_of("b", &mut live), 1);

        let mut empty = Vec::new();
        assert_eq!(position_of("ghost", &mut empty), 0);
    }

    #[tokio::test]
    async fn local_peer_is_position_zero_and_settles_instantly() {
        let peer = LocalPeer::default();
        assert_eq!(peer.position().await, 0);

        let start = tokio::time::Instant::now();
        peer.settle(Duration::from_secs(60)).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn local_peer_broadcast_is_noop() {
        let peer = LocalPeer::default();
        let state = Arc::new(CountingState(AtomicUsize::new(0)));
        let broadcast = peer.register("nfl", state.clone()).await.unwrap();
        broadcast.notify();
        broadcast.notify();
        assert_eq!(state.0.load(Ordering::SeqCst), 0, "nothing merges locally");
    }
}
