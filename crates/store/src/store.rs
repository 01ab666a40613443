//! The fingerprint-keyed alert store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use klaxon_core::{Alert, Fingerprint};

use crate::error::StoreError;

/// Tuning knobs for an [`AlertStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Effective lifetime assigned to alerts that arrive without an end
    /// time. Producers are expected to re-put firing alerts well within
    /// this window.
    pub resolve_timeout: Duration,

    /// How often the GC sweep runs.
    pub gc_interval: Duration,

    /// How long a resolved alert is retained past its end time.
    pub grace_period: Duration,

    /// Extra capacity a subscriber channel gets beyond the snapshot it is
    /// seeded with. A subscriber that falls this far behind is dropped.
    pub subscriber_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(5 * 60),
            gc_interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(0),
            subscriber_buffer: 200,
        }
    }
}

struct Inner {
    alerts: HashMap<Fingerprint, Alert>,
    subscribers: HashMap<u64, mpsc::Sender<Alert>>,
    next_subscriber: u64,
}

/// The in-memory alert store.
///
/// Exclusively owns alert objects; everything downstream works on clones.
/// A single mutex protects the alert map and the subscriber list, and
/// broadcasts happen under it with non-blocking sends so a slow subscriber
/// can never stall a producer.
pub struct AlertStore {
    inner: Arc<Mutex<Inner>>,
    config: StoreConfig,
}

impl AlertStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                alerts: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscriber: 0,
            })),
            config,
        }
    }

    /// Ingest a batch of alerts.
    ///
    /// Each alert is validated and normalized: `updated_at` is stamped,
    /// a zero `starts_at` becomes now, and a missing `ends_at` becomes
    /// `now + resolve_timeout` with the `timeout` flag set. The most
    /// recently received payload for a fingerprint wins outright.
    ///
    /// Invalid alerts are skipped; the first validation error is returned
    /// after the rest of the batch has been processed.
    pub fn put(&self, alerts: impl IntoIterator<Item = Alert>) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut first_err: Option<StoreError> = None;

        let mut inner = self.inner.lock();
        for mut alert in alerts {
            if let Err(err) = alert.labels.validate() {
                debug!(error = %err, "rejecting invalid alert");
                first_err.get_or_insert(err.into());
                continue;
            }

            alert.updated_at = now;
            if alert.starts_at == chrono::DateTime::UNIX_EPOCH {
                alert.starts_at = now;
            }
            if alert.ends_at.is_none() {
                // Anchored at ingestion, not starts_at: a backdated start
                // must not produce an alert that is born resolved.
                alert.ends_at = Some(
                    now + chrono::Duration::from_std(self.config.resolve_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300)),
                );
                alert.timeout = true;
            }

            let fp = alert.fingerprint();
            inner.alerts.insert(fp, alert.clone());

            // Non-blocking fan-out; a full or closed channel drops the
            // subscriber rather than the producer.
            let mut dead = Vec::new();
            for (id, tx) in &inner.subscribers {
                match tx.try_send(alert.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = id, "alert subscriber overflowed, dropping it");
                        dead.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                    }
                }
            }
            for id in dead {
                inner.subscribers.remove(&id);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Look up an alert by fingerprint.
    pub fn get(&self, fp: Fingerprint) -> Result<Alert, StoreError> {
        self.inner
            .lock()
            .alerts
            .get(&fp)
            .cloned()
            .ok_or(StoreError::NotFound(fp))
    }

    /// Subscribe to the alert stream.
    ///
    /// The subscription yields every currently-known alert first, then
    /// every subsequent `put`, until the subscriber drops it or falls too
    /// far behind.
    #[must_use]
    pub fn subscribe(&self) -> AlertSubscription {
        let mut inner = self.inner.lock();
        let capacity = inner.alerts.len() + self.config.subscriber_buffer;
        let (tx, rx) = mpsc::channel(capacity.max(1));

        // Seed with the current contents; capacity covers the snapshot.
        for alert in inner.alerts.values() {
            let _ = tx.try_send(alert.clone());
        }

        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, tx);
        debug!(subscriber = id, capacity, "alert subscriber registered");

        AlertSubscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Snapshot of all currently non-resolved alerts.
    #[must_use]
    pub fn pending(&self) -> Vec<Alert> {
        let now = Utc::now();
        self.inner
            .lock()
            .alerts
            .values()
            .filter(|a| !a.resolved_at(now))
            .cloned()
            .collect()
    }

    /// Snapshot of every alert, firing or resolved.
    #[must_use]
    pub fn all(&self) -> Vec<Alert> {
        self.inner.lock().alerts.values().cloned().collect()
    }

    /// Number of alerts currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().alerts.len()
    }

    /// Whether the store holds no alerts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().alerts.is_empty()
    }

    /// Remove the alerts in `snapshot` that are still unmodified.
    ///
    /// An alert is deleted only when its `updated_at` matches the
    /// snapshot's value, so an alert that was re-put after the snapshot
    /// was taken survives. Used after a successful flush to expire
    /// delivered resolved alerts without losing re-fired ones.
    pub fn delete_if_not_modified(&self, snapshot: &[Alert]) {
        let mut inner = self.inner.lock();
        for alert in snapshot {
            let fp = alert.fingerprint();
            if inner
                .alerts
                .get(&fp)
                .is_some_and(|cur| cur.updated_at == alert.updated_at)
            {
                inner.alerts.remove(&fp);
            }
        }
    }

    /// Run one GC sweep, returning the removed alerts.
    ///
    /// Removes alerts whose end time is at least `grace_period` in the
    /// past. Doomed entries are collected and removed under the lock; the
    /// caller receives them afterwards.
    #[must_use]
    pub fn gc(&self) -> Vec<Alert> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.grace_period)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let mut inner = self.inner.lock();
        let doomed: Vec<Fingerprint> = inner
            .alerts
            .iter()
            .filter(|(_, a)| a.ends_at.is_some_and(|e| e <= cutoff))
            .map(|(fp, _)| *fp)
            .collect();
        doomed
            .into_iter()
            .filter_map(|fp| inner.alerts.remove(&fp))
            .collect()
    }

    /// Periodic GC loop.
    ///
    /// Sweeps every `gc_interval`, invoking `on_removed` with each
    /// non-empty removal set after the store lock is released. Exits when
    /// the shutdown signal flips.
    pub async fn run(
        &self,
        on_removed: impl Fn(Vec<Alert>) + Send + Sync,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(self.config.gc_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let removed = self.gc();
                    if !removed.is_empty() {
                        debug!(count = removed.len(), "garbage collected resolved alerts");
                        on_removed(removed);
                    }
                }
                _ = shutdown.changed() => {
                    info!("alert store GC stopping");
                    return;
                }
            }
        }
    }
}

/// A live subscription to the alert stream.
///
/// Dropping the subscription deregisters it from the store.
pub struct AlertSubscription {
    id: u64,
    rx: mpsc::Receiver<Alert>,
    inner: Arc<Mutex<Inner>>,
}

impl AlertSubscription {
    /// Receive the next alert. Returns `None` once the subscription has
    /// been dropped by the store (overflow) or the store is gone.
    pub async fn recv(&mut self) -> Option<Alert> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for draining in tests and maintenance.
    pub fn try_recv(&mut self) -> Option<Alert> {
        self.rx.try_recv().ok()
    }
}

impl Drop for AlertSubscription {
    fn drop(&mut self) {
        self.inner.lock().subscribers.remove(&self.id);
    }
}
