//! The dispatcher: alert stream in, aggregation groups out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use klaxon_core::{Alert, Fingerprint, LabelSet, Route};
use klaxon_notify::Pipeline;
use klaxon_store::{AlertStore, Marker};

use crate::group::AggrGroup;

/// Tuning knobs for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often empty groups are swept away.
    pub maintenance_interval: Duration,

    /// Cap on concurrently existing aggregation groups. When reached,
    /// alerts that would create a new group are dropped for that route
    /// with a counter increment; existing groups keep receiving.
    pub max_groups: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(30),
            max_groups: None,
        }
    }
}

/// Counters for dispatcher activity.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Alerts consumed from the store subscription.
    pub processed: AtomicU64,
    /// Cumulative alert-processing time, nanoseconds.
    pub processing_ns: AtomicU64,
    /// Alerts dropped because the group cap was reached.
    pub limited_drops: AtomicU64,
    /// Groups created over the dispatcher's lifetime.
    pub groups_created: AtomicU64,
}

/// Admin snapshot of one aggregation group.
#[derive(Debug, Clone)]
pub struct AlertGroup {
    pub route_id: String,
    pub group_key: String,
    pub labels: LabelSet,
    pub receiver: String,
    pub alerts: Vec<Alert>,
}

struct GroupHandle {
    group: Arc<AggrGroup>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RouteGroups {
    groups: Mutex<HashMap<Fingerprint, GroupHandle>>,
}

/// Routes alerts into aggregation groups and owns their schedulers.
///
/// Lock layout: a coarse outer lock guards only the per-route map (taken
/// for writing exclusively when a route sees its first group), and each
/// route carries its own inner lock, so steady-state ingest and admin
/// snapshots do not serialize against each other.
pub struct Dispatcher {
    route: Arc<Route>,
    store: Arc<AlertStore>,
    pipeline: Arc<Pipeline>,
    marker: Arc<Marker>,
    config: DispatcherConfig,
    metrics: Arc<DispatchMetrics>,
    routes: RwLock<HashMap<String, Arc<RouteGroups>>>,
    group_count: AtomicUsize,
}

impl Dispatcher {
    /// Create a dispatcher over a compiled route tree.
    #[must_use]
    pub fn new(
        route: Arc<Route>,
        store: Arc<AlertStore>,
        pipeline: Arc<Pipeline>,
        marker: Arc<Marker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            route,
            store,
            pipeline,
            marker,
            config,
            metrics: Arc::new(DispatchMetrics::default()),
            routes: RwLock::new(HashMap::new()),
            group_count: AtomicUsize::new(0),
        }
    }

    /// Dispatcher activity counters.
    #[must_use]
    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    /// Number of live aggregation groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.group_count.load(Ordering::Acquire)
    }

    /// The ingest loop: consume the alert stream until shutdown, running
    /// maintenance on the side.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut sub = self.store.subscribe();
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        maintenance.tick().await;

        let mut shutdown_rx = shutdown.clone();
        info!("dispatcher starting");
        loop {
            tokio::select! {
                alert = sub.recv() => {
                    match alert {
                        Some(alert) => self.process(alert, &shutdown),
                        None => {
                            // Only happens if this subscriber overflowed;
                            // the dispatcher cannot continue without the
                            // stream.
                            error!("alert stream closed, dispatcher stopping");
                            return;
                        }
                    }
                }
                _ = maintenance.tick() => {
                    self.maintenance();
                }
                _ = shutdown_rx.changed() => {
                    info!("dispatcher stopping");
                    return;
                }
            }
        }
    }

    /// Route one alert into its aggregation groups.
    #[instrument(skip_all, fields(alert = %alert.labels))]
    fn process(&self, alert: Alert, shutdown: &watch::Receiver<bool>) {
        let start = std::time::Instant::now();
        for route in self.route.matches(&alert.labels) {
            self.insert_into_group(route, &alert, shutdown);
        }
        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .processing_ns
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    fn insert_into_group(&self, route: &Route, alert: &Alert, shutdown: &watch::Receiver<bool>) {
        let group_labels = route.group_labels(&alert.labels);
        let group_fp = group_labels.fingerprint();

        let route_groups = {
            let routes = self.routes.read();
            routes.get(route.id()).cloned()
        };
        let route_groups = route_groups.unwrap_or_else(|| {
            let mut routes = self.routes.write();
            Arc::clone(routes.entry(route.id().to_owned()).or_default())
        });

        let mut groups = route_groups.groups.lock();
        if let Some(handle) = groups.get(&group_fp) {
            handle.group.insert(alert.clone());
            return;
        }

        if let Some(max) = self.config.max_groups
            && self.group_count.load(Ordering::Acquire) >= max
        {
            self.metrics.limited_drops.fetch_add(1, Ordering::Relaxed);
            warn!(
                route = route.id(),
                max, "aggregation group limit reached, dropping alert for this route"
            );
            return;
        }

        let group = Arc::new(AggrGroup::new(
            route.id(),
            route.receiver(),
            route.opts().clone(),
            group_labels,
        ));
        // First alert lands before the scheduler starts, so the initial
        // group-wait flush can never observe an empty group.
        group.insert(alert.clone());

        let task = tokio::spawn(
            Arc::clone(&group).run(Arc::clone(&self.pipeline), shutdown.clone()),
        );
        debug!(group = group.key(), "aggregation group created");
        groups.insert(group_fp, GroupHandle { group, task });
        self.group_count.fetch_add(1, Ordering::Release);
        self.metrics.groups_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Sweep empty groups: cancel their schedulers and drop their marker
    /// entries.
    pub fn maintenance(&self) {
        let routes: Vec<(String, Arc<RouteGroups>)> = {
            let routes = self.routes.read();
            routes
                .iter()
                .map(|(id, rg)| (id.clone(), Arc::clone(rg)))
                .collect()
        };

        for (route_id, route_groups) in routes {
            let mut groups = route_groups.groups.lock();
            groups.retain(|group_fp, handle| {
                if handle.group.empty() {
                    handle.task.abort();
                    self.marker.delete_group(&route_id, *group_fp);
                    self.group_count.fetch_sub(1, Ordering::Release);
                    debug!(group = handle.group.key(), "empty aggregation group removed");
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Stable-sorted snapshot of the current groups for the admin
    /// surface.
    ///
    /// Alerts no longer present in the store are omitted, so the
    /// snapshot never reports state the store has already forgotten.
    #[must_use]
    pub fn groups(
        &self,
        route_filter: impl Fn(&str) -> bool,
        alert_filter: impl Fn(&Alert) -> bool,
    ) -> Vec<AlertGroup> {
        let mut out = Vec::new();
        let routes: Vec<(String, Arc<RouteGroups>)> = {
            let routes = self.routes.read();
            routes
                .iter()
                .map(|(id, rg)| (id.clone(), Arc::clone(rg)))
                .collect()
        };

        for (route_id, route_groups) in routes {
            if !route_filter(&route_id) {
                continue;
            }
            let groups = route_groups.groups.lock();
            for handle in groups.values() {
                let alerts: Vec<Alert> = handle
                    .group
                    .alerts()
                    .into_iter()
                    .filter(|a| self.store.get(a.fingerprint()).is_ok())
                    .filter(|a| alert_filter(a))
                    .collect();
                out.push(AlertGroup {
                    route_id: route_id.clone(),
                    group_key: handle.group.key().to_owned(),
                    labels: handle.group.labels().clone(),
                    receiver: handle.group.receiver().to_owned(),
                    alerts,
                });
            }
        }

        out.sort_by(|a, b| {
            (&a.receiver, &a.group_key).cmp(&(&b.receiver, &b.group_key))
        });
        out
    }
}
