//! The in-memory, gossiped notification log.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use klaxon_cluster::{Broadcast, GossipState};

use crate::error::NflogError;
use crate::proto::{Entry, decode_batch, encode_batch};

/// Tuning knobs for the notification log.
#[derive(Debug, Clone)]
pub struct NflogConfig {
    /// Minimum lifetime of an entry. Effective expiry per entry is
    /// `max(retention, 2 * repeat_interval)` from the send time, supplied
    /// by the caller of [`Nflog::log`].
    pub retention: Duration,

    /// How often expired entries are dropped and the snapshot rewritten.
    pub maintenance_interval: Duration,

    /// Snapshot file; `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for NflogConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(120 * 60 * 60),
            maintenance_interval: Duration::from_secs(15 * 60),
            snapshot_path: None,
        }
    }
}

/// Counters for log activity.
#[derive(Debug, Default)]
pub struct NflogMetrics {
    pub queries: AtomicU64,
    pub updates: AtomicU64,
    pub merges: AtomicU64,
    pub gc_removed: AtomicU64,
}

/// The notification log: a last-writer-wins map keyed by
/// (group key, receiver).
pub struct Nflog {
    entries: RwLock<HashMap<(String, String), Entry>>,
    config: NflogConfig,
    broadcast: RwLock<Broadcast>,
    metrics: NflogMetrics,
}

impl Nflog {
    /// Create a log, loading the snapshot file when one is configured.
    ///
    /// A corrupt snapshot is logged and degrades to whatever prefix
    /// decoded; it never prevents startup.
    pub fn new(config: NflogConfig) -> Result<Self, NflogError> {
        let log = Self {
            entries: RwLock::new(HashMap::new()),
            config,
            broadcast: RwLock::new(Broadcast::noop()),
            metrics: NflogMetrics::default(),
        };

        if let Some(path) = log.config.snapshot_path.clone() {
            match fs::read(&path) {
                Ok(buf) => {
                    let (entries, err) = decode_batch(&buf);
                    if let Some(err) = err {
                        error!(path = %path.display(), error = %err, "notification log snapshot is corrupt, loading decoded prefix");
                    }
                    let count = entries.len();
                    log.merge_entries(entries);
                    info!(path = %path.display(), count, "loaded notification log snapshot");
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(log)
    }

    /// Install the gossip broadcast handle.
    pub fn set_broadcast(&self, broadcast: Broadcast) {
        *self.broadcast.write() = broadcast;
    }

    /// The configured minimum entry lifetime.
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.config.retention
    }

    /// Activity counters.
    #[must_use]
    pub fn metrics(&self) -> &NflogMetrics {
        &self.metrics
    }

    /// Record a sent notification.
    ///
    /// Upserts locally iff `now` is newer than the existing entry, then
    /// announces the change to peers.
    pub fn log(
        &self,
        receiver: &str,
        group_key: &str,
        group_hash: u64,
        resolved: bool,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) {
        let entry = Entry {
            group_key: group_key.to_owned(),
            receiver: receiver.to_owned(),
            group_hash,
            resolved,
            timestamp_ms: now.timestamp_millis(),
            expires_at_ms: expires_at.timestamp_millis(),
        };

        let updated = {
            let mut entries = self.entries.write();
            let key = (entry.group_key.clone(), entry.receiver.clone());
            match entries.get(&key) {
                Some(existing) if existing.timestamp_ms >= entry.timestamp_ms => false,
                _ => {
                    entries.insert(key, entry);
                    true
                }
            }
        };

        if updated {
            self.metrics.updates.fetch_add(1, Ordering::Relaxed);
            self.broadcast.read().notify();
        }
    }

    /// The most recent non-expired entry for (group key, receiver).
    pub fn query(&self, receiver: &str, group_key: &str) -> Result<Entry, NflogError> {
        self.metrics.queries.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        self.entries
            .read()
            .get(&(group_key.to_owned(), receiver.to_owned()))
            .filter(|e| !e.expired_at(now))
            .cloned()
            .ok_or_else(|| NflogError::NotFound {
                group_key: group_key.to_owned(),
                receiver: receiver.to_owned(),
            })
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Fold remote entries in: per key the larger timestamp wins, and
    /// entries already past expiry are never (re)introduced.
    pub fn merge_entries(&self, remote: impl IntoIterator<Item = Entry>) {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let mut changed = 0_u64;
        for entry in remote {
            if entry.expired_at(now) {
                continue;
            }
            let key = (entry.group_key.clone(), entry.receiver.clone());
            match entries.get(&key) {
                Some(existing) if existing.timestamp_ms >= entry.timestamp_ms => {}
                _ => {
                    entries.insert(key, entry);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.metrics.merges.fetch_add(changed, Ordering::Relaxed);
        }
    }

    /// Drop expired entries, returning how many were removed.
    pub fn gc(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.expired_at(now));
        let removed = before - entries.len();
        if removed > 0 {
            self.metrics
                .gc_removed
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "notification log GC");
        }
        removed
    }

    /// Serialize all live entries, sorted for determinism.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        let entries = self.entries.read();
        let mut sorted: Vec<&Entry> = entries.values().collect();
        sorted.sort_by(|a, b| (&a.group_key, &a.receiver).cmp(&(&b.group_key, &b.receiver)));
        encode_batch(sorted)
    }

    /// Write the snapshot file via create-temp + rename.
    pub fn write_snapshot(&self) -> Result<(), NflogError> {
        let Some(path) = &self.config.snapshot_path else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.snapshot())?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), entries = self.len(), "wrote notification log snapshot");
        Ok(())
    }

    /// Maintenance loop: GC and snapshot every interval, with a final
    /// snapshot on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.maintenance_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup does not
        // rewrite the snapshot it just loaded.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.gc();
                    if let Err(err) = self.write_snapshot() {
                        warn!(error = %err, "notification log snapshot failed");
                    }
                }
                _ = shutdown.changed() => {
                    self.gc();
                    if let Err(err) = self.write_snapshot() {
                        warn!(error = %err, "final notification log snapshot failed");
                    }
                    info!("notification log maintenance stopping");
                    return;
                }
            }
        }
    }
}

impl GossipState for Nflog {
    fn full_state(&self) -> Vec<u8> {
        self.snapshot()
    }

    fn merge(&self, remote: &[u8]) {
        let (entries, err) = decode_batch(remote);
        if let Some(err) = err {
            warn!(error = %err, "undecodable notification log gossip, merging decoded prefix");
        }
        self.merge_entries(entries);
    }
}
