//! Chitchat-backed cluster peer.
//!
//! Membership and dissemination ride on chitchat's scuttlebutt protocol:
//! every registered channel publishes its serialized state under a
//! versioned key on the local node state, and remote key changes are fed
//! into the channel's merge callback. Because the replicated components
//! merge with last-writer-wins rules, exchanging full state is convergent
//! regardless of delivery order, and a joining peer catches up through
//! chitchat's digest sync.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chitchat::transport::Transport;
use chitchat::{
    Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig, ListenerHandle,
    spawn_chitchat,
};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::peer::{Broadcast, GossipState, Peer, position_of};

/// Keys carrying channel state are namespaced so they can never collide
/// with membership metadata.
const STATE_KEY_PREFIX: &str = "st:";

/// Configuration for joining the gossip mesh.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Logical cluster identifier; must match on every peer.
    pub cluster_name: String,

    /// Stable, unique name of this peer. Peer positions are the sorted
    /// order of these names.
    pub node_name: String,

    /// UDP address to listen on for gossip.
    pub listen_addr: SocketAddr,

    /// Address advertised to peers, when it differs from `listen_addr`.
    pub advertise_addr: Option<SocketAddr>,

    /// Seed peers (`host:port`) used for discovery.
    pub seeds: Vec<String>,

    /// Gossip round interval.
    pub gossip_interval: Duration,

    /// Cluster size (including this peer) that `settle` waits for.
    pub expected_peers: usize,
}

impl ClusterConfig {
    /// Config with defaults for everything but identity and address.
    #[must_use]
    pub fn new(node_name: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            cluster_name: "klaxon".to_owned(),
            node_name: node_name.into(),
            listen_addr,
            advertise_addr: None,
            seeds: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            expected_peers: 1,
        }
    }

    /// Set the seed list.
    #[must_use]
    pub fn seeds(mut self, seeds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    /// Set the settle target.
    #[must_use]
    pub fn expected_peers(mut self, n: usize) -> Self {
        self.expected_peers = n;
        self
    }
}

#[derive(Default)]
struct Channels {
    names: HashSet<String>,
    // Dropping a listener handle unsubscribes it; keep them alive for the
    // lifetime of the peer.
    listeners: Vec<ListenerHandle>,
}

/// A gossiping member of the notification cluster.
pub struct ClusterPeer {
    node_name: String,
    expected_peers: usize,
    chitchat: Arc<Mutex<Chitchat>>,
    channels: parking_lot::Mutex<Channels>,
    // Dropping the handle tears down the gossip sockets and tasks.
    _handle: ChitchatHandle,
}

impl ClusterPeer {
    /// Join the cluster over the given transport.
    pub async fn join(config: ClusterConfig, transport: &dyn Transport) -> Result<Self, ClusterError> {
        let advertise = config.advertise_addr.unwrap_or(config.listen_addr);
        let chitchat_id = ChitchatId::new(config.node_name.clone(), 0, advertise);

        info!(
            cluster = %config.cluster_name,
            node = %config.node_name,
            listen = %config.listen_addr,
            seeds = ?config.seeds,
            "joining cluster"
        );

        let chitchat_config = ChitchatConfig {
            cluster_id: config.cluster_name.clone(),
            chitchat_id,
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seeds.clone(),
            failure_detector_config: FailureDetectorConfig::default(),
            marked_for_deletion_grace_period: Duration::from_secs(3600),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(chitchat_config, Vec::new(), transport)
            .await
            .map_err(|e| ClusterError::Join(e.to_string()))?;
        let chitchat = handle.chitchat();

        Ok(Self {
            node_name: config.node_name,
            expected_peers: config.expected_peers.max(1),
            chitchat,
            channels: parking_lot::Mutex::new(Channels::default()),
            _handle: handle,
        })
    }

    /// Names of the peers currently considered live, this one included.
    pub async fn live_peers(&self) -> Vec<String> {
        let chitchat = self.chitchat.lock().await;
        let mut names: Vec<String> = chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect();
        names.push(self.node_name.clone());
        names.sort_unstable();
        names.dedup();
        names
    }
}

#[async_trait]
impl Peer for ClusterPeer {
    fn name(&self) -> &str {
        &self.node_name
    }

    async fn position(&self) -> usize {
        let mut live = self.live_peers().await;
        position_of(&self.node_name, &mut live)
    }

    async fn settle(&self, timeout: Duration) {
        let expected = self.expected_peers;
        let mut stream = self.chitchat.lock().await.live_nodes_watch_stream();

        let waited = tokio::time::timeout(timeout, async {
            while let Some(nodes) = stream.next().await {
                let others = nodes
                    .keys()
                    .filter(|id| id.node_id != self.node_name)
                    .count();
                if others + 1 >= expected {
                    return;
                }
            }
        })
        .await;

        match waited {
            Ok(()) => info!(expected, "cluster settled"),
            Err(_) => warn!(
                expected,
                timeout_secs = timeout.as_secs(),
                "cluster settle timed out, continuing with the peers seen so far"
            ),
        }
    }

    async fn register(
        &self,
        channel: &str,
        state: Arc<dyn GossipState>,
    ) -> Result<Broadcast, ClusterError> {
        if !self.channels.lock().names.insert(channel.to_owned()) {
            return Err(ClusterError::DuplicateChannel(channel.to_owned()));
        }
        let key = format!("{STATE_KEY_PREFIX}{channel}");

        let mut chitchat = self.chitchat.lock().await;

        // Catch up on channel state from peers that joined before us.
        let ids: Vec<ChitchatId> = chitchat.live_nodes().cloned().collect();
        for id in ids {
            if id.node_id == self.node_name {
                continue;
            }
            if let Some(value) = chitchat.node_state(&id).and_then(|ns| ns.get(&key)) {
                match BASE64.decode(value) {
                    Ok(bytes) => state.merge(&bytes),
                    Err(err) => {
                        warn!(channel, peer = %id.node_id, error = %err, "undecodable gossip state")
                    }
                }
            }
        }

        // Merge every future remote update for this channel.
        let merge_state = Arc::clone(&state);
        let self_name = self.node_name.clone();
        let chan = channel.to_owned();
        let listener = chitchat.subscribe_event(key.clone(), move |event| {
            if event.node.node_id == self_name {
                return;
            }
            match BASE64.decode(event.value) {
                Ok(bytes) => {
                    debug!(channel = %chan, peer = %event.node.node_id, "merging gossip state");
                    merge_state.merge(&bytes);
                }
                Err(err) => {
                    warn!(channel = %chan, peer = %event.node.node_id, error = %err, "undecodable gossip state");
                }
            }
        });

        // Publish the initial state so joining peers can pull it.
        chitchat
            .self_node_state()
            .set(key.clone(), BASE64.encode(state.full_state()));
        drop(chitchat);

        self.channels.lock().listeners.push(listener);

        // Re-publish on demand, coalescing notification bursts.
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let chitchat = Arc::clone(&self.chitchat);
        let chan = channel.to_owned();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                while rx.try_recv().is_ok() {}
                let payload = BASE64.encode(state.full_state());
                chitchat.lock().await.self_node_state().set(key.clone(), payload);
                debug!(channel = %chan, "published gossip state");
            }
            debug!(channel = %chan, "gossip publisher stopped");
        });

        Ok(Broadcast::new(tx))
    }
}
