//! Engine wiring.
//!
//! The [`EngineBuilder`] assembles the store, silence engine,
//! notification log, inhibitor, cluster peer and dispatcher into one
//! running [`Engine`]: gossip channels are registered first, the peer is
//! given time to settle, and only then does the dispatcher start
//! ingesting, so the very first notifications already consider peer
//! state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::info;

use klaxon_cluster::{ClusterError, LocalPeer, Peer};
use klaxon_core::{RouteConfig, TimeInterval, ValidationError};
use klaxon_dispatch::{Dispatcher, DispatcherConfig};
use klaxon_inhibit::{InhibitRule, Inhibitor};
use klaxon_nflog::{Nflog, NflogConfig, NflogError};
use klaxon_notify::{PipelineBuilder, Receiver, SendBackoff};
use klaxon_silence::{SilenceConfig, SilenceError, Silences};
use klaxon_store::{AlertStore, Marker, StoreConfig};

/// Gossip channel names, fixed so peers of any build interoperate.
const CHANNEL_NFLOG: &str = "nfl";
const CHANNEL_SILENCES: &str = "silences";

/// Errors surfaced while assembling or starting the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Route(#[from] ValidationError),

    #[error(transparent)]
    Nflog(#[from] NflogError),

    #[error(transparent)]
    Silences(#[from] SilenceError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Assembles an [`Engine`].
pub struct EngineBuilder {
    route: RouteConfig,
    receivers: Vec<Receiver>,
    inhibit_rules: Vec<InhibitRule>,
    time_intervals: HashMap<String, TimeInterval>,
    store_config: StoreConfig,
    dispatcher_config: DispatcherConfig,
    nflog_config: NflogConfig,
    silence_config: SilenceConfig,
    peer: Option<Arc<dyn Peer>>,
    peer_timeout: Duration,
    settle_timeout: Duration,
    backoff: SendBackoff,
}

impl EngineBuilder {
    /// Start from a route tree; everything else has defaults.
    #[must_use]
    pub fn new(route: RouteConfig) -> Self {
        Self {
            route,
            receivers: Vec::new(),
            inhibit_rules: Vec::new(),
            time_intervals: HashMap::new(),
            store_config: StoreConfig::default(),
            dispatcher_config: DispatcherConfig::default(),
            nflog_config: NflogConfig::default(),
            silence_config: SilenceConfig::default(),
            peer: None,
            peer_timeout: Duration::from_secs(15),
            settle_timeout: Duration::from_secs(30),
            backoff: SendBackoff::default(),
        }
    }

    /// Add a receiver.
    #[must_use]
    pub fn receiver(mut self, receiver: Receiver) -> Self {
        self.receivers.push(receiver);
        self
    }

    /// Set the inhibit rules.
    #[must_use]
    pub fn inhibit_rules(mut self, rules: Vec<InhibitRule>) -> Self {
        self.inhibit_rules = rules;
        self
    }

    /// Named time intervals referenced by routes.
    #[must_use]
    pub fn time_intervals(mut self, intervals: HashMap<String, TimeInterval>) -> Self {
        self.time_intervals = intervals;
        self
    }

    /// Alert store tuning.
    #[must_use]
    pub fn store_config(mut self, config: StoreConfig) -> Self {
        self.store_config = config;
        self
    }

    /// Dispatcher tuning.
    #[must_use]
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Notification log tuning and persistence.
    #[must_use]
    pub fn nflog_config(mut self, config: NflogConfig) -> Self {
        self.nflog_config = config;
        self
    }

    /// Silence engine tuning and persistence.
    #[must_use]
    pub fn silence_config(mut self, config: SilenceConfig) -> Self {
        self.silence_config = config;
        self
    }

    /// Join a cluster through this peer. Without one the engine runs
    /// clusterless with a [`LocalPeer`].
    #[must_use]
    pub fn peer(mut self, peer: Arc<dyn Peer>) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Per-position wait applied before sends (cluster mode).
    #[must_use]
    pub fn peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    /// How long `start` waits for the cluster to settle.
    #[must_use]
    pub fn settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    /// Retry/backoff policy for sends.
    #[must_use]
    pub fn backoff(mut self, backoff: SendBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Assemble and start the engine.
    pub async fn start(self) -> Result<Engine, EngineError> {
        let route = Arc::new(self.route.compile()?);
        let store = Arc::new(AlertStore::new(self.store_config));
        let marker = Arc::new(Marker::new());
        let nflog = Arc::new(Nflog::new(self.nflog_config)?);
        let silences = Arc::new(Silences::new(self.silence_config)?);
        let peer: Arc<dyn Peer> = self
            .peer
            .unwrap_or_else(|| Arc::new(LocalPeer::default()));

        // Wire replicated state into the gossip mesh before anything can
        // notify, then give the mesh a chance to settle.
        nflog.set_broadcast(
            peer.register(CHANNEL_NFLOG, Arc::clone(&nflog) as Arc<dyn klaxon_cluster::GossipState>)
                .await?,
        );
        silences.set_broadcast(
            peer.register(
                CHANNEL_SILENCES,
                Arc::clone(&silences) as Arc<dyn klaxon_cluster::GossipState>,
            )
            .await?,
        );
        peer.settle(self.settle_timeout).await;

        let inhibitor = Arc::new(Inhibitor::new(
            self.inhibit_rules,
            Arc::clone(&store),
            Arc::clone(&marker),
        ));

        let mut pipeline = PipelineBuilder::new(Arc::clone(&marker))
            .time_intervals(self.time_intervals)
            .silences(Arc::clone(&silences))
            .inhibitor(Arc::clone(&inhibitor))
            .peer(Arc::clone(&peer), self.peer_timeout)
            .nflog(Arc::clone(&nflog))
            .backoff(self.backoff);
        for receiver in self.receivers {
            pipeline = pipeline.receiver(receiver);
        }
        let pipeline = Arc::new(pipeline.build());

        let dispatcher = Arc::new(Dispatcher::new(
            route,
            Arc::clone(&store),
            Arc::clone(&pipeline),
            Arc::clone(&marker),
            self.dispatcher_config,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = TaskTracker::new();

        {
            let store = Arc::clone(&store);
            let marker = Arc::clone(&marker);
            let rx = shutdown_rx.clone();
            tasks.spawn(async move {
                store
                    .run(
                        move |removed| {
                            for alert in removed {
                                marker.delete(alert.fingerprint());
                            }
                        },
                        rx,
                    )
                    .await;
            });
        }
        {
            let nflog = Arc::clone(&nflog);
            let rx = shutdown_rx.clone();
            tasks.spawn(async move { nflog.run(rx).await });
        }
        {
            let silences = Arc::clone(&silences);
            let rx = shutdown_rx.clone();
            tasks.spawn(async move { silences.run(rx).await });
        }
        {
            let dispatcher = Arc::clone(&dispatcher);
            let rx = shutdown_rx.clone();
            tasks.spawn(async move { dispatcher.run(rx).await });
        }
        tasks.close();

        info!(peer = peer.name(), "engine started");
        Ok(Engine {
            store,
            marker,
            silences,
            nflog,
            inhibitor,
            dispatcher,
            peer,
            shutdown_tx,
            tasks,
        })
    }
}

/// A running alert-router core.
pub struct Engine {
    store: Arc<AlertStore>,
    marker: Arc<Marker>,
    silences: Arc<Silences>,
    nflog: Arc<Nflog>,
    inhibitor: Arc<Inhibitor>,
    dispatcher: Arc<Dispatcher>,
    peer: Arc<dyn Peer>,
    shutdown_tx: watch::Sender<bool>,
    tasks: TaskTracker,
}

impl Engine {
    /// The alert store (producer ingest and admin reads).
    #[must_use]
    pub fn store(&self) -> &Arc<AlertStore> {
        &self.store
    }

    /// The marker registry (admin mute predicates).
    #[must_use]
    pub fn marker(&self) -> &Arc<Marker> {
        &self.marker
    }

    /// The silence engine (admin CRUD).
    #[must_use]
    pub fn silences(&self) -> &Arc<Silences> {
        &self.silences
    }

    /// The notification log.
    #[must_use]
    pub fn nflog(&self) -> &Arc<Nflog> {
        &self.nflog
    }

    /// The inhibitor.
    #[must_use]
    pub fn inhibitor(&self) -> &Arc<Inhibitor> {
        &self.inhibitor
    }

    /// The dispatcher (admin group snapshots).
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The cluster peer.
    #[must_use]
    pub fn peer(&self) -> &Arc<dyn Peer> {
        &self.peer
    }

    /// Signal shutdown and wait for every subsystem task to finish.
    ///
    /// Flushes in flight complete within their own interval budgets;
    /// maintenance loops write their final snapshots on the way out.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.tasks.wait().await;
        info!("engine stopped");
    }
}
