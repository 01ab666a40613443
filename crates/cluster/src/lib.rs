//! Cluster membership and gossip channels.
//!
//! Replicated state (the notification log and the silence set) registers a
//! named channel with the local [`Peer`]. The peer gossips each channel's
//! serialized state to the rest of the cluster and feeds remote state into
//! the channel's `merge` callback. Membership also yields the peer's
//! *position* (its index in the sorted list of live peer names), which the
//! notification pipeline uses to stagger sends across peers.

pub mod error;
pub mod gossip;
pub mod peer;

pub use error::ClusterError;
pub use gossip::{ClusterConfig, ClusterPeer};
pub use peer::{Broadcast, GossipState, LocalPeer, Peer, position_of};
