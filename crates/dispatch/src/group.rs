//! One aggregation group and its scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

use klaxon_core::{Alert, LabelSet, RouteOpts};
use klaxon_notify::{FlushContext, Pipeline};
use klaxon_store::{AlertStore, StoreConfig};

/// The set of alerts sharing a route and a group-labels value.
///
/// The group owns a private alert store for its members and a scheduler
/// task (spawned by the dispatcher) that flushes it through the pipeline.
/// Inserts and flushes race only on that store; the scheduler is the
/// single flight driving notifications, so sends for one group are
/// strictly ordered.
pub struct AggrGroup {
    group_key: String,
    labels: LabelSet,
    route_id: String,
    receiver: String,
    opts: RouteOpts,
    alerts: AlertStore,
    flush_now: Notify,
    has_flushed: AtomicBool,
}

impl AggrGroup {
    /// Create a group for `labels` at the given route.
    #[must_use]
    pub fn new(route_id: &str, receiver: &str, opts: RouteOpts, labels: LabelSet) -> Self {
        let group_key = format!("{route_id}/{labels}");
        Self {
            group_key,
            labels,
            route_id: route_id.to_owned(),
            receiver: receiver.to_owned(),
            opts,
            alerts: AlertStore::new(StoreConfig::default()),
            flush_now: Notify::new(),
            has_flushed: AtomicBool::new(false),
        }
    }

    /// The group's stable key: route id plus group labels.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.group_key
    }

    /// The group labels.
    #[must_use]
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// The receiver this group notifies.
    #[must_use]
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// The route id this group belongs to.
    #[must_use]
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Snapshot of the group's current alerts.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.all()
    }

    /// Whether the group holds no alerts (and may be garbage collected).
    #[must_use]
    pub fn empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Add an alert to the group.
    ///
    /// If the group has not flushed yet and this alert is already older
    /// than the group wait, the scheduler is told to flush immediately:
    /// the alert has waited long enough at a previous incarnation of the
    /// group or on the producer side.
    pub fn insert(&self, alert: Alert) {
        let late = !self.has_flushed.load(Ordering::Acquire)
            && outlived_group_wait(alert.starts_at, self.opts.group_wait, Utc::now());

        if let Err(err) = self.alerts.put([alert]) {
            warn!(group = %self.group_key, error = %err, "dropping invalid alert at group insert");
            return;
        }
        if late {
            self.flush_now.notify_one();
        }
    }

    /// Run one flush through the pipeline.
    ///
    /// The snapshot is evaluated against a fixed `now`: resolved alerts
    /// keep their end time, firing alerts have it cleared so a slow
    /// delivery cannot make them appear resolved downstream. The whole
    /// pipeline is bounded by the group interval; on success the
    /// delivered resolved alerts are expired from the group unless they
    /// were re-put meanwhile.
    pub async fn flush(&self, pipeline: &Pipeline) {
        let now = Utc::now();
        let mut snapshot = self.alerts.all();
        if snapshot.is_empty() {
            return;
        }
        snapshot.sort_by_key(Alert::fingerprint);

        let batch: Vec<Alert> = snapshot
            .iter()
            .map(|a| {
                if a.resolved_at(now) {
                    a.clone()
                } else {
                    let mut firing = a.clone();
                    firing.ends_at = None;
                    firing
                }
            })
            .collect();

        let ctx = FlushContext {
            now,
            group_key: self.group_key.clone(),
            group_labels: self.labels.clone(),
            route_id: self.route_id.clone(),
            receiver: self.receiver.clone(),
            repeat_interval: self.opts.repeat_interval,
            flush_budget: self.opts.group_interval,
            mute_time_intervals: self.opts.mute_time_intervals.clone(),
            active_time_intervals: self.opts.active_time_intervals.clone(),
        };

        debug!(group = %self.group_key, alerts = batch.len(), "flushing group");
        match pipeline.exec(&ctx, batch).await {
            Ok(_) => {
                let resolved: Vec<Alert> = snapshot
                    .into_iter()
                    .filter(|a| a.resolved_at(now))
                    .collect();
                if !resolved.is_empty() {
                    self.alerts.delete_if_not_modified(&resolved);
                }
            }
            Err(err @ klaxon_notify::NotifyError::Timeout { .. }) => {
                debug!(group = %self.group_key, error = %err, "group flush hit its deadline, deferring to the next interval");
            }
            Err(err) => {
                warn!(group = %self.group_key, error = %err, "group flush failed");
            }
        }
    }

    /// The scheduler loop.
    ///
    /// Arms a `group_wait` timer on creation, then re-arms with
    /// `group_interval` after every flush. A late first insert collapses
    /// the initial wait. Shutdown exits between flushes; a flush in
    /// flight finishes within its own budget.
    pub async fn run(
        self: Arc<Self>,
        pipeline: Arc<Pipeline>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut next = tokio::time::Instant::now() + self.opts.group_wait;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(next) => {
                    self.flush(&pipeline).await;
                    self.has_flushed.store(true, Ordering::Release);
                    next = tokio::time::Instant::now() + self.opts.group_interval;
                }
                () = self.flush_now.notified() => {
                    next = tokio::time::Instant::now();
                }
                _ = shutdown.changed() => {
                    debug!(group = %self.group_key, "group scheduler stopping");
                    return;
                }
            }
        }
    }
}

/// Whether a first-wait insert has already outlived the group wait.
///
/// Strictly past the wait only: an alert landing exactly at the boundary
/// still rides the armed timer.
fn outlived_group_wait(
    starts_at: DateTime<Utc>,
    group_wait: std::time::Duration,
    now: DateTime<Utc>,
) -> bool {
    chrono::Duration::from_std(group_wait)
        .ok()
        .is_some_and(|wait| starts_at + wait < now)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use klaxon_core::RouteConfig;
    use klaxon_store::Marker;

    use klaxon_notify::PipelineBuilder;

    use super::*;

    fn opts(wait_ms: u64, interval_ms: u64) -> RouteOpts {
        let route = RouteConfig::with_receiver("pager")
            .group_wait(Duration::from_millis(wait_ms))
            .group_interval(Duration::from_millis(interval_ms))
            .compile()
            .unwrap();
        route.opts().clone()
    }

    fn alert(service: &str) -> Alert {
        let mut alert = Alert::new(LabelSet::from([("service", service)]));
        alert.starts_at = Utc::now();
        alert
    }

    #[test]
    fn key_combines_route_and_labels() {
        let group = AggrGroup::new(
            "{}",
            "pager",
            opts(10, 100),
            LabelSet::from([("service", "api")]),
        );
        assert_eq!(group.key(), r#"{}/{service="api"}"#);
        assert!(group.empty());
    }

    #[test]
    fn group_wait_boundary_is_not_late() {
        let now = Utc::now();
        let wait = Duration::from_millis(500);
        let elapsed = chrono::Duration::milliseconds(500);

        assert!(
            !outlived_group_wait(now - elapsed, wait, now),
            "landing exactly at the boundary rides the timer"
        );
        assert!(outlived_group_wait(
            now - elapsed - chrono::Duration::milliseconds(1),
            wait,
            now
        ));
        assert!(!outlived_group_wait(now, wait, now));
    }

    #[test]
    fn insert_keeps_latest_per_fingerprint() {
        let group = AggrGroup::new("{}", "pager", opts(10, 100), LabelSet::new());
        group.insert(alert("api"));
        group.insert(alert("api"));
        group.insert(alert("db"));
        assert_eq!(group.alerts().len(), 2);
    }

    #[tokio::test]
    async fn flush_clears_delivered_resolved_alerts() {
        // A pipeline with a blackhole receiver delivers successfully.
        let pipeline = PipelineBuilder::new(Arc::new(Marker::new()))
            .receiver(klaxon_notify::Receiver::new("pager"))
            .build();

        let group = AggrGroup::new("{}", "pager", opts(10, 1000), LabelSet::new());
        group.insert(alert("firing"));
        group.insert(alert("done").with_ends_at(Utc::now() - chrono::Duration::seconds(1)));
        assert_eq!(group.alerts().len(), 2);

        group.flush(&pipeline).await;
        let left = group.alerts();
        assert_eq!(left.len(), 1, "resolved alert expired after delivery");
        assert_eq!(left[0].labels.get("service"), Some("firing"));
    }
}
