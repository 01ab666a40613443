//! Stage chaining and pipeline assembly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, warn};

use klaxon_cluster::Peer;
use klaxon_core::{Alert, TimeInterval};
use klaxon_inhibit::Inhibitor;
use klaxon_nflog::Nflog;
use klaxon_silence::Silences;
use klaxon_store::Marker;

use crate::context::FlushContext;
use crate::error::NotifyError;
use crate::integration::Receiver;
use crate::retry::SendBackoff;
use crate::stages::{
    DedupStage, InhibitStage, RetryStage, SetNotifiesStage, SilenceStage, TimeMuteStage, WaitStage,
};

/// One pipeline stage.
///
/// A stage receives the flush context and the current alert batch and
/// returns the batch to hand to the next stage. Returning an empty batch
/// ends the flush successfully; returning an error aborts it.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn exec(&self, ctx: &FlushContext, alerts: Vec<Alert>) -> Result<Vec<Alert>, NotifyError>;
}

/// Runs stages in order, stopping early once the batch is empty.
struct MultiStage {
    stages: Vec<Arc<dyn Stage>>,
}

#[async_trait]
impl Stage for MultiStage {
    async fn exec(
        &self,
        ctx: &FlushContext,
        mut alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        for stage in &self.stages {
            if alerts.is_empty() {
                return Ok(alerts);
            }
            alerts = stage.exec(ctx, alerts).await?;
        }
        Ok(alerts)
    }
}

/// Runs one chain per integration concurrently; the flush fails if any
/// chain fails, so the next interval retries the whole receiver.
struct FanoutStage {
    chains: Vec<Arc<dyn Stage>>,
}

#[async_trait]
impl Stage for FanoutStage {
    async fn exec(
        &self,
        ctx: &FlushContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let sends = self
            .chains
            .iter()
            .map(|chain| chain.exec(ctx, alerts.clone()));
        let results = futures::future::join_all(sends).await;

        let mut first_err = None;
        for result in results {
            if let Err(err) = result {
                warn!(receiver = %ctx.receiver, error = %err, "integration chain failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(alerts),
        }
    }
}

/// Counters for pipeline activity.
///
/// Relaxed ordering throughout; snapshot for a consistent read.
#[derive(Debug, Default)]
pub struct NotifyMetrics {
    pub notifications: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    pub deduplicated: AtomicU64,
    pub suppressed_silence: AtomicU64,
    pub suppressed_inhibit: AtomicU64,
    pub muted_by_time: AtomicU64,
}

impl NotifyMetrics {
    /// A point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> NotifyMetricsSnapshot {
        NotifyMetricsSnapshot {
            notifications: self.notifications.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            suppressed_silence: self.suppressed_silence.load(Ordering::Relaxed),
            suppressed_inhibit: self.suppressed_inhibit.load(Ordering::Relaxed),
            muted_by_time: self.muted_by_time.load(Ordering::Relaxed),
        }
    }
}

/// Plain-data snapshot of [`NotifyMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyMetricsSnapshot {
    pub notifications: u64,
    pub failed: u64,
    pub retries: u64,
    pub deduplicated: u64,
    pub suppressed_silence: u64,
    pub suppressed_inhibit: u64,
    pub muted_by_time: u64,
}

/// The assembled notification pipeline.
///
/// Entry stages (time mute, inhibit, silence) run once per flush; the
/// receiver named by the context then fans out to its integrations, each
/// with its own wait / dedup / retry / record chain.
pub struct Pipeline {
    entry: Vec<Arc<dyn Stage>>,
    receivers: HashMap<String, Arc<dyn Stage>>,
    metrics: Arc<NotifyMetrics>,
}

impl Pipeline {
    /// Run one flush through every stage.
    ///
    /// Returns the alerts that survived the mute stages on success. An
    /// empty input or a fully muted batch is a successful no-op.
    #[instrument(skip(self, alerts), fields(group = %ctx.group_key, receiver = %ctx.receiver))]
    pub async fn exec(
        &self,
        ctx: &FlushContext,
        mut alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        if alerts.is_empty() {
            return Ok(alerts);
        }
        for stage in &self.entry {
            alerts = stage.exec(ctx, alerts).await?;
            if alerts.is_empty() {
                return Ok(alerts);
            }
        }

        let Some(receiver) = self.receivers.get(&ctx.receiver) else {
            return Err(NotifyError::UnknownReceiver(ctx.receiver.clone()));
        };
        match receiver.exec(ctx, alerts).await {
            Ok(alerts) => Ok(alerts),
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Pipeline activity counters.
    #[must_use]
    pub fn metrics(&self) -> &NotifyMetrics {
        &self.metrics
    }
}

/// Assembles a [`Pipeline`] from its collaborators.
///
/// Only the marker is unconditionally required; omitting a collaborator
/// omits its stage, which keeps tests and partial deployments honest
/// about what they exercise.
pub struct PipelineBuilder {
    time_intervals: HashMap<String, TimeInterval>,
    silences: Option<Arc<Silences>>,
    inhibitor: Option<Arc<Inhibitor>>,
    marker: Arc<Marker>,
    peer: Option<Arc<dyn Peer>>,
    peer_timeout: Duration,
    nflog: Option<Arc<Nflog>>,
    backoff: SendBackoff,
    receivers: Vec<Receiver>,
}

impl PipelineBuilder {
    /// Start a builder around the shared marker registry.
    #[must_use]
    pub fn new(marker: Arc<Marker>) -> Self {
        Self {
            time_intervals: HashMap::new(),
            silences: None,
            inhibitor: None,
            marker,
            peer: None,
            peer_timeout: Duration::from_secs(15),
            nflog: None,
            backoff: SendBackoff::default(),
            receivers: Vec::new(),
        }
    }

    /// Named time intervals referenced by routes.
    #[must_use]
    pub fn time_intervals(mut self, intervals: HashMap<String, TimeInterval>) -> Self {
        self.time_intervals = intervals;
        self
    }

    /// Enable the silence stage.
    #[must_use]
    pub fn silences(mut self, silences: Arc<Silences>) -> Self {
        self.silences = Some(silences);
        self
    }

    /// Enable the inhibit stage.
    #[must_use]
    pub fn inhibitor(mut self, inhibitor: Arc<Inhibitor>) -> Self {
        self.inhibitor = Some(inhibitor);
        self
    }

    /// Enable the peer-position wait stage.
    #[must_use]
    pub fn peer(mut self, peer: Arc<dyn Peer>, peer_timeout: Duration) -> Self {
        self.peer = Some(peer);
        self.peer_timeout = peer_timeout;
        self
    }

    /// Enable cross-peer deduplication through the notification log.
    #[must_use]
    pub fn nflog(mut self, nflog: Arc<Nflog>) -> Self {
        self.nflog = Some(nflog);
        self
    }

    /// Backoff policy for the retry stage.
    #[must_use]
    pub fn backoff(mut self, backoff: SendBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Add a receiver and its integrations.
    #[must_use]
    pub fn receiver(mut self, receiver: Receiver) -> Self {
        self.receivers.push(receiver);
        self
    }

    /// Assemble the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline {
        let metrics = Arc::new(NotifyMetrics::default());

        let mut entry: Vec<Arc<dyn Stage>> = vec![Arc::new(TimeMuteStage {
            intervals: Arc::new(self.time_intervals),
            marker: Arc::clone(&self.marker),
            metrics: Arc::clone(&metrics),
        })];
        if let Some(inhibitor) = self.inhibitor {
            entry.push(Arc::new(InhibitStage {
                inhibitor,
                metrics: Arc::clone(&metrics),
            }));
        }
        if let Some(silences) = self.silences {
            entry.push(Arc::new(SilenceStage {
                silences,
                marker: Arc::clone(&self.marker),
                metrics: Arc::clone(&metrics),
            }));
        }

        let mut receivers: HashMap<String, Arc<dyn Stage>> = HashMap::new();
        for receiver in self.receivers {
            let mut chains: Vec<Arc<dyn Stage>> = Vec::new();
            for (idx, integration) in receiver.integrations().iter().enumerate() {
                let recv_key = format!("{}/{}/{idx}", receiver.name(), integration.name());
                let mut stages: Vec<Arc<dyn Stage>> = Vec::new();
                if let Some(peer) = &self.peer {
                    stages.push(Arc::new(WaitStage {
                        peer: Arc::clone(peer),
                        peer_timeout: self.peer_timeout,
                    }));
                }
                if let Some(nflog) = &self.nflog {
                    stages.push(Arc::new(DedupStage {
                        nflog: Arc::clone(nflog),
                        recv_key: recv_key.clone(),
                        metrics: Arc::clone(&metrics),
                    }));
                }
                stages.push(Arc::new(RetryStage {
                    integration: Arc::clone(integration),
                    backoff: self.backoff.staggered_for(&recv_key),
                    metrics: Arc::clone(&metrics),
                }));
                if let Some(nflog) = &self.nflog {
                    stages.push(Arc::new(SetNotifiesStage {
                        nflog: Arc::clone(nflog),
                        recv_key,
                    }));
                }
                chains.push(Arc::new(MultiStage { stages }));
            }
            receivers.insert(
                receiver.name().to_owned(),
                Arc::new(FanoutStage { chains }),
            );
        }

        Pipeline {
            entry,
            receivers,
            metrics,
        }
    }
}
