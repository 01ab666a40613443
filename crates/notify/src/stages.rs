//! The concrete pipeline stages.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

use klaxon_cluster::Peer;
use klaxon_core::{Alert, TimeInterval};
use klaxon_inhibit::Inhibitor;
use klaxon_nflog::Nflog;
use klaxon_silence::Silences;
use klaxon_store::Marker;

use crate::context::FlushContext;
use crate::error::NotifyError;
use crate::integration::Integration;
use crate::pipeline::{NotifyMetrics, Stage};
use crate::retry::SendBackoff;

/// Stable hash over an alert batch and its firing/resolved split.
///
/// Hashing the (fingerprint, resolved) pairs rather than bare
/// fingerprints means an alert transitioning from firing to resolved
/// changes the hash, so the resolved notification is not deduplicated
/// away. Returns the hash and whether the batch is entirely resolved.
#[must_use]
pub fn group_hash(alerts: &[Alert], now: DateTime<Utc>) -> (u64, bool) {
    let mut items: Vec<(u64, bool)> = alerts
        .iter()
        .map(|a| (a.fingerprint().0, a.resolved_at(now)))
        .collect();
    items.sort_unstable();

    let mut hasher = Xxh3::new();
    let mut all_resolved = !alerts.is_empty();
    for (fp, resolved) in items {
        hasher.update(&fp.to_le_bytes());
        hasher.update(&[u8::from(resolved)]);
        if !resolved {
            all_resolved = false;
        }
    }
    (hasher.digest(), all_resolved)
}

/// Mutes whole groups by route-level time intervals.
pub(crate) struct TimeMuteStage {
    pub(crate) intervals: Arc<HashMap<String, TimeInterval>>,
    pub(crate) marker: Arc<Marker>,
    pub(crate) metrics: Arc<NotifyMetrics>,
}

impl TimeMuteStage {
    fn contains(&self, name: &str, now: DateTime<Utc>) -> Option<bool> {
        match self.intervals.get(name) {
            Some(interval) => Some(interval.contains(now)),
            None => {
                warn!(interval = name, "route references an unknown time interval");
                None
            }
        }
    }
}

#[async_trait]
impl Stage for TimeMuteStage {
    async fn exec(
        &self,
        ctx: &FlushContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let mut muted_by: Vec<String> = ctx
            .mute_time_intervals
            .iter()
            .filter(|name| self.contains(name, ctx.now) == Some(true))
            .cloned()
            .collect();

        if !ctx.active_time_intervals.is_empty() {
            let inside_any = ctx
                .active_time_intervals
                .iter()
                .any(|name| self.contains(name, ctx.now) == Some(true));
            if !inside_any {
                muted_by.extend(ctx.active_time_intervals.iter().cloned());
            }
        }

        let group_fp = ctx.group_labels.fingerprint();
        if muted_by.is_empty() {
            self.marker.set_group_muted(&ctx.route_id, group_fp, Vec::new());
            Ok(alerts)
        } else {
            debug!(group = %ctx.group_key, intervals = ?muted_by, "group muted by time interval");
            self.metrics
                .muted_by_time
                .fetch_add(alerts.len() as u64, Ordering::Relaxed);
            self.marker.set_group_muted(&ctx.route_id, group_fp, muted_by);
            Ok(Vec::new())
        }
    }
}

/// Drops alerts muted by a firing source alert.
pub(crate) struct InhibitStage {
    pub(crate) inhibitor: Arc<Inhibitor>,
    pub(crate) metrics: Arc<NotifyMetrics>,
}

#[async_trait]
impl Stage for InhibitStage {
    async fn exec(
        &self,
        _ctx: &FlushContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let before = alerts.len();
        let kept: Vec<Alert> = alerts
            .into_iter()
            .filter(|a| !self.inhibitor.mutes(&a.labels))
            .collect();
        let dropped = before - kept.len();
        if dropped > 0 {
            self.metrics
                .suppressed_inhibit
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        Ok(kept)
    }
}

/// Drops alerts muted by an active silence.
pub(crate) struct SilenceStage {
    pub(crate) silences: Arc<Silences>,
    pub(crate) marker: Arc<Marker>,
    pub(crate) metrics: Arc<NotifyMetrics>,
}

#[async_trait]
impl Stage for SilenceStage {
    async fn exec(
        &self,
        _ctx: &FlushContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let before = alerts.len();
        let mut kept = Vec::with_capacity(alerts.len());
        for alert in alerts {
            let (muted, ids) = self.silences.mutes(&alert.labels);
            self.marker.set_silenced(alert.fingerprint(), ids);
            if !muted {
                kept.push(alert);
            }
        }
        let dropped = before - kept.len();
        if dropped > 0 {
            self.metrics
                .suppressed_silence
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        Ok(kept)
    }
}

/// Sleeps out this peer's cluster position so lower-position peers send
/// first and their notification log entries arrive in time to
/// deduplicate ours.
pub(crate) struct WaitStage {
    pub(crate) peer: Arc<dyn Peer>,
    pub(crate) peer_timeout: Duration,
}

#[async_trait]
impl Stage for WaitStage {
    async fn exec(
        &self,
        _ctx: &FlushContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let position = self.peer.position().await;
        if position > 0 {
            let wait = self.peer_timeout * u32::try_from(position).unwrap_or(u32::MAX);
            debug!(position, wait_ms = wait.as_millis() as u64, "waiting on peer position");
            tokio::time::sleep(wait).await;
        }
        Ok(alerts)
    }
}

/// Suppresses sends the notification log says were already made.
pub(crate) struct DedupStage {
    pub(crate) nflog: Arc<Nflog>,
    pub(crate) recv_key: String,
    pub(crate) metrics: Arc<NotifyMetrics>,
}

#[async_trait]
impl Stage for DedupStage {
    async fn exec(
        &self,
        ctx: &FlushContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let (hash, _) = group_hash(&alerts, ctx.now);
        let Ok(entry) = self.nflog.query(&self.recv_key, &ctx.group_key) else {
            return Ok(alerts);
        };

        let repeat = chrono::Duration::from_std(ctx.repeat_interval)
            .unwrap_or_else(|_| chrono::Duration::hours(4));
        if entry.group_hash == hash && entry.timestamp() > ctx.now - repeat {
            debug!(
                group = %ctx.group_key,
                receiver = %self.recv_key,
                "notification suppressed, already sent"
            );
            self.metrics.deduplicated.fetch_add(1, Ordering::Relaxed);
            return Ok(Vec::new());
        }
        Ok(alerts)
    }
}

/// Calls the integration, backing off on retryable failures until the
/// flush's time budget runs out.
pub(crate) struct RetryStage {
    pub(crate) integration: Arc<dyn Integration>,
    pub(crate) backoff: SendBackoff,
    pub(crate) metrics: Arc<NotifyMetrics>,
}

#[async_trait]
impl Stage for RetryStage {
    async fn exec(
        &self,
        ctx: &FlushContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let batch: Vec<Alert> = if self.integration.sends_resolved() {
            alerts.clone()
        } else {
            alerts
                .iter()
                .filter(|a| !a.resolved_at(ctx.now))
                .cloned()
                .collect()
        };
        // Nothing this integration wants; the notification still counts
        // as made so the log advances.
        if batch.is_empty() {
            return Ok(alerts);
        }

        let send_loop = async {
            let mut attempt: u32 = 0;
            loop {
                match self.integration.send(ctx, &batch).await {
                    Ok(()) => {
                        info!(
                            integration = self.integration.name(),
                            group = %ctx.group_key,
                            alerts = batch.len(),
                            "notification sent"
                        );
                        self.metrics.notifications.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(err) if err.is_retryable() => {
                        let delay = self.backoff.delay_for(attempt, ctx.flush_budget);
                        warn!(
                            integration = self.integration.name(),
                            group = %ctx.group_key,
                            attempt,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "retryable send failure"
                        );
                        self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => {
                        warn!(
                            integration = self.integration.name(),
                            group = %ctx.group_key,
                            error = %err,
                            "permanent send failure"
                        );
                        return Err(NotifyError::Integration {
                            integration: self.integration.name().to_owned(),
                            source: err,
                        });
                    }
                }
            }
        };

        match tokio::time::timeout(ctx.flush_budget, send_loop).await {
            Ok(Ok(())) => Ok(alerts),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(NotifyError::Timeout {
                integration: self.integration.name().to_owned(),
            }),
        }
    }
}

/// Records the send in the notification log. Runs only after a
/// successful send, so a failed flush never advances the log.
pub(crate) struct SetNotifiesStage {
    pub(crate) nflog: Arc<Nflog>,
    pub(crate) recv_key: String,
}

#[async_trait]
impl Stage for SetNotifiesStage {
    async fn exec(
        &self,
        ctx: &FlushContext,
        alerts: Vec<Alert>,
    ) -> Result<Vec<Alert>, NotifyError> {
        let (hash, resolved) = group_hash(&alerts, ctx.now);
        let lifetime = self.nflog.retention().max(2 * ctx.repeat_interval);
        let expires_at = ctx.now
            + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::hours(240));
        self.nflog.log(
            &self.recv_key,
            &ctx.group_key,
            hash,
            resolved,
            ctx.now,
            expires_at,
        );
        Ok(alerts)
    }
}
