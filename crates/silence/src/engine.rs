//! The silence engine.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use klaxon_cluster::{Broadcast, GossipState};
use klaxon_core::{Fingerprint, LabelSet};

use crate::error::SilenceError;
use crate::proto::{decode_batch, encode_batch, encoded_len};
use crate::types::{QueryFilter, Silence, SilenceState};

/// Tuning knobs for the silence engine.
#[derive(Debug, Clone)]
pub struct SilenceConfig {
    /// How long an expired silence is kept (and gossiped) before GC.
    pub retention: Duration,

    /// How often expired silences are dropped and the snapshot rewritten.
    pub maintenance_interval: Duration,

    /// Snapshot file; `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,

    /// Cap on active + pending silences. `None` is unlimited.
    pub max_silences: Option<usize>,

    /// Cap on the encoded size of one silence. `None` is unlimited.
    pub max_silence_size_bytes: Option<usize>,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(120 * 60 * 60),
            maintenance_interval: Duration::from_secs(15 * 60),
            snapshot_path: None,
            max_silences: None,
            max_silence_size_bytes: None,
        }
    }
}

/// Counters for engine activity.
#[derive(Debug, Default)]
pub struct SilenceMetrics {
    pub queries: AtomicU64,
    pub mutes_cache_hits: AtomicU64,
    pub merges: AtomicU64,
    pub gc_removed: AtomicU64,
    pub limit_rejections: AtomicU64,
}

#[derive(Clone)]
struct CachedMutes {
    version: u64,
    ids: Vec<String>,
}

/// Now, truncated to the millisecond precision of the wire format, so
/// last-writer-wins comparisons behave identically before and after a
/// record crosses the wire.
fn now_ms() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap_or(DateTime::UNIX_EPOCH)
}

/// The gossiped set of silences.
///
/// Readers dominate: `mutes` runs on every pipeline flush, writes come
/// from operators and gossip merges. A version counter stamps the mutes
/// cache; any mutation bumps it, invalidating cached results lazily.
pub struct Silences {
    silences: RwLock<HashMap<String, Silence>>,
    cache: Mutex<HashMap<Fingerprint, CachedMutes>>,
    version: AtomicU64,
    broadcast: RwLock<Broadcast>,
    config: SilenceConfig,
    metrics: SilenceMetrics,
}

impl Silences {
    /// Create an engine, loading the snapshot file when configured.
    ///
    /// A corrupt snapshot is logged and degrades to the decoded prefix.
    pub fn new(config: SilenceConfig) -> Result<Self, SilenceError> {
        let engine = Self {
            silences: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            version: AtomicU64::new(0),
            broadcast: RwLock::new(Broadcast::noop()),
            config,
            metrics: SilenceMetrics::default(),
        };

        if let Some(path) = engine.config.snapshot_path.clone() {
            match fs::read(&path) {
                Ok(buf) => {
                    let (silences, err) = decode_batch(&buf);
                    if let Some(err) = err {
                        error!(path = %path.display(), error = %err, "silence snapshot is corrupt, loading decoded prefix");
                    }
                    let count = silences.len();
                    engine.merge_silences(silences);
                    info!(path = %path.display(), count, "loaded silence snapshot");
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(engine)
    }

    /// Install the gossip broadcast handle.
    pub fn set_broadcast(&self, broadcast: Broadcast) {
        *self.broadcast.write() = broadcast;
    }

    /// Activity counters.
    #[must_use]
    pub fn metrics(&self) -> &SilenceMetrics {
        &self.metrics
    }

    /// Create or update a silence, returning its id.
    ///
    /// A new silence gets a fresh time-ordered id. Updating an existing
    /// silence keeps the id when the matchers are unchanged and the
    /// silence has not started yet (or only its end moves); otherwise the
    /// old silence is expired and the update becomes a new silence.
    pub fn set(&self, mut silence: Silence) -> Result<String, SilenceError> {
        silence.validate()?;
        if let Some(max) = self.config.max_silence_size_bytes {
            let size = encoded_len(&silence);
            if size > max {
                self.metrics.limit_rejections.fetch_add(1, Ordering::Relaxed);
                warn!(size, max, "rejecting oversized silence");
                return Err(SilenceError::LimitExceeded(format!(
                    "silence is {size} bytes, limit is {max}"
                )));
            }
        }

        let now = now_ms();
        let mut silences = self.silences.write();

        if silence.id.is_empty() {
            if let Some(max) = self.config.max_silences {
                let live = silences
                    .values()
                    .filter(|s| s.state_at(now) != SilenceState::Expired)
                    .count();
                if live >= max {
                    self.metrics.limit_rejections.fetch_add(1, Ordering::Relaxed);
                    warn!(live, max, "rejecting silence over the count limit");
                    return Err(SilenceError::LimitExceeded(format!(
                        "{live} active and pending silences, limit is {max}"
                    )));
                }
            }
            silence.id = Uuid::now_v7().to_string();
            silence.updated_at = now;
            let id = silence.id.clone();
            silences.insert(id.clone(), silence);
            drop(silences);
            self.bump();
            debug!(id = %id, "silence created");
            return Ok(id);
        }

        let Some(prev) = silences.get(&silence.id).cloned() else {
            return Err(SilenceError::NotFound(silence.id));
        };
        if prev.state_at(now) == SilenceState::Expired {
            return Err(SilenceError::Expired(silence.id));
        }

        let updatable = prev.matchers == silence.matchers
            && (prev.state_at(now) == SilenceState::Pending || prev.starts_at == silence.starts_at);

        if updatable {
            silence.updated_at = now;
            let id = silence.id.clone();
            silences.insert(id.clone(), silence);
            drop(silences);
            self.bump();
            debug!(id = %id, "silence updated in place");
            Ok(id)
        } else {
            // Expire the predecessor and issue the update under a new id,
            // continuing the id chain.
            let mut expired = prev;
            expired.ends_at = now.max(expired.starts_at);
            expired.updated_at = now;
            silences.insert(expired.id.clone(), expired);

            silence.id = Uuid::now_v7().to_string();
            silence.updated_at = now;
            let id = silence.id.clone();
            silences.insert(id.clone(), silence);
            drop(silences);
            self.bump();
            debug!(id = %id, "silence superseded its predecessor");
            Ok(id)
        }
    }

    /// Expire a silence now.
    ///
    /// A pending silence becomes permanently expired; an active one is
    /// truncated at now. Expiry is monotonic: re-expiring fails.
    pub fn expire(&self, id: &str) -> Result<(), SilenceError> {
        let now = now_ms();
        let mut silences = self.silences.write();
        let Some(silence) = silences.get_mut(id) else {
            return Err(SilenceError::NotFound(id.to_owned()));
        };
        if silence.state_at(now) == SilenceState::Expired {
            return Err(SilenceError::Expired(id.to_owned()));
        }
        silence.ends_at = now.max(silence.starts_at);
        silence.updated_at = now;
        drop(silences);
        self.bump();
        debug!(id, "silence expired");
        Ok(())
    }

    /// Fetch one silence by id.
    pub fn get(&self, id: &str) -> Result<Silence, SilenceError> {
        self.silences
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SilenceError::NotFound(id.to_owned()))
    }

    /// Silences matching the filter, sorted by id for stable output.
    #[must_use]
    pub fn query(&self, filter: &QueryFilter) -> Vec<Silence> {
        self.metrics.queries.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let mut out: Vec<Silence> = self
            .silences
            .read()
            .values()
            .filter(|s| filter.accepts(s, now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Whether any active silence mutes the label set, and which ones.
    ///
    /// Results are cached per label-set fingerprint and invalidated by
    /// the version counter on any mutation.
    #[must_use]
    pub fn mutes(&self, labels: &LabelSet) -> (bool, Vec<String>) {
        let version = self.version.load(Ordering::Acquire);
        let fp = labels.fingerprint();

        if let Some(cached) = self.cache.lock().get(&fp)
            && cached.version == version
        {
            self.metrics.mutes_cache_hits.fetch_add(1, Ordering::Relaxed);
            return (!cached.ids.is_empty(), cached.ids.clone());
        }

        let now = Utc::now();
        let mut ids: Vec<String> = self
            .silences
            .read()
            .values()
            .filter(|s| s.state_at(now) == SilenceState::Active && s.matches(labels))
            .map(|s| s.id.clone())
            .collect();
        ids.sort_unstable();

        self.cache.lock().insert(
            fp,
            CachedMutes {
                version,
                ids: ids.clone(),
            },
        );
        (!ids.is_empty(), ids)
    }

    /// Number of silences currently held (all states within retention).
    #[must_use]
    pub fn len(&self) -> usize {
        self.silences.read().len()
    }

    /// Whether the engine holds no silences.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.silences.read().is_empty()
    }

    /// Fold remote silences in: per id the larger `updated_at` wins, and
    /// silences past retention are never (re)introduced. Because expiry
    /// always bumps `updated_at`, an expired silence can never be revived
    /// by a stale remote copy.
    pub fn merge_silences(&self, remote: impl IntoIterator<Item = Silence>) {
        let retention =
            chrono::Duration::from_std(self.config.retention).unwrap_or_else(|_| chrono::Duration::hours(120));
        let horizon = Utc::now() - retention;
        let mut changed = 0_u64;
        {
            let mut silences = self.silences.write();
            for silence in remote {
                if silence.ends_at <= horizon || silence.id.is_empty() {
                    continue;
                }
                // Larger updated_at wins; on a tie the earlier end wins,
                // so expiry can never lose to a same-stamp predecessor.
                let replace = match silences.get(&silence.id) {
                    None => true,
                    Some(existing) => {
                        silence.updated_at > existing.updated_at
                            || (silence.updated_at == existing.updated_at
                                && silence.ends_at < existing.ends_at)
                    }
                };
                if replace {
                    silences.insert(silence.id.clone(), silence);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.metrics.merges.fetch_add(changed, Ordering::Relaxed);
            self.bump();
        }
    }

    /// Drop silences past retention, returning how many were removed.
    pub fn gc(&self) -> usize {
        let retention =
            chrono::Duration::from_std(self.config.retention).unwrap_or_else(|_| chrono::Duration::hours(120));
        let horizon = Utc::now() - retention;
        let mut silences = self.silences.write();
        let before = silences.len();
        silences.retain(|_, s| s.ends_at > horizon);
        let removed = before - silences.len();
        drop(silences);
        if removed > 0 {
            self.metrics
                .gc_removed
                .fetch_add(removed as u64, Ordering::Relaxed);
            self.bump();
            debug!(removed, "silence GC");
        }
        removed
    }

    /// Serialize all silences, sorted by id for determinism.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        let silences = self.silences.read();
        let mut sorted: Vec<&Silence> = silences.values().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        encode_batch(sorted)
    }

    /// Write the snapshot file via create-temp + rename.
    pub fn write_snapshot(&self) -> Result<(), SilenceError> {
        let Some(path) = &self.config.snapshot_path else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.snapshot())?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), silences = self.len(), "wrote silence snapshot");
        Ok(())
    }

    /// Maintenance loop: GC and snapshot every interval, with a final
    /// snapshot on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.maintenance_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.gc();
                    if let Err(err) = self.write_snapshot() {
                        warn!(error = %err, "silence snapshot failed");
                    }
                }
                _ = shutdown.changed() => {
                    self.gc();
                    if let Err(err) = self.write_snapshot() {
                        warn!(error = %err, "final silence snapshot failed");
                    }
                    info!("silence maintenance stopping");
                    return;
                }
            }
        }
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::Release);
        self.broadcast.read().notify();
    }
}

impl GossipState for Silences {
    fn full_state(&self) -> Vec<u8> {
        self.snapshot()
    }

    fn merge(&self, remote: &[u8]) {
        let (silences, err) = decode_batch(remote);
        if let Some(err) = err {
            warn!(error = %err, "undecodable silence gossip, merging decoded prefix");
        }
        self.merge_silences(silences);
    }
}
