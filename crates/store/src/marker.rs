//! Why-is-this-muted bookkeeping.
//!
//! The pipeline stages record here which silences, source alerts or time
//! intervals are currently muting an alert or a whole group, so the admin
//! surface can answer `silencedBy` / `inhibitedBy` / `mutedBy` without
//! re-running the predicates.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use klaxon_core::Fingerprint;

/// Processing state of an alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    /// Not yet seen by the pipeline.
    #[default]
    Unprocessed,
    /// Passed the mute predicates; eligible for notification.
    Active,
    /// Muted by at least one silence or inhibition.
    Suppressed,
}

/// The mute status of one alert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertStatus {
    pub state: AlertState,
    /// Ids of the active silences muting this alert.
    #[serde(default)]
    pub silenced_by: Vec<String>,
    /// Fingerprints of the source alerts inhibiting this alert.
    #[serde(default)]
    pub inhibited_by: Vec<Fingerprint>,
}

impl AlertStatus {
    fn recompute(&mut self) {
        self.state = if self.silenced_by.is_empty() && self.inhibited_by.is_empty() {
            AlertState::Active
        } else {
            AlertState::Suppressed
        };
    }
}

#[derive(Default)]
struct MarkerInner {
    alerts: HashMap<Fingerprint, AlertStatus>,
    /// Time-interval mutes per (route id, group fingerprint).
    groups: HashMap<(String, Fingerprint), Vec<String>>,
}

/// Shared registry of alert and group mute status.
#[derive(Default)]
pub struct Marker {
    inner: Mutex<MarkerInner>,
}

impl Marker {
    /// Create an empty marker registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the silences muting an alert; an empty list clears them.
    pub fn set_silenced(&self, fp: Fingerprint, silence_ids: Vec<String>) {
        let mut inner = self.inner.lock();
        let status = inner.alerts.entry(fp).or_default();
        status.silenced_by = silence_ids;
        status.recompute();
    }

    /// Record the source alerts inhibiting an alert; empty clears them.
    pub fn set_inhibited(&self, fp: Fingerprint, sources: Vec<Fingerprint>) {
        let mut inner = self.inner.lock();
        let status = inner.alerts.entry(fp).or_default();
        status.inhibited_by = sources;
        status.recompute();
    }

    /// The current status of an alert.
    #[must_use]
    pub fn status(&self, fp: Fingerprint) -> AlertStatus {
        self.inner.lock().alerts.get(&fp).cloned().unwrap_or_default()
    }

    /// Whether the alert is currently muted by silences or inhibitions.
    #[must_use]
    pub fn muted(&self, fp: Fingerprint) -> bool {
        self.status(fp).state == AlertState::Suppressed
    }

    /// Forget an alert, typically after store GC.
    pub fn delete(&self, fp: Fingerprint) {
        self.inner.lock().alerts.remove(&fp);
    }

    /// Record the time intervals muting a whole group; empty clears them.
    pub fn set_group_muted(&self, route_id: &str, group_fp: Fingerprint, intervals: Vec<String>) {
        let mut inner = self.inner.lock();
        if intervals.is_empty() {
            inner.groups.remove(&(route_id.to_owned(), group_fp));
        } else {
            inner.groups.insert((route_id.to_owned(), group_fp), intervals);
        }
    }

    /// The time intervals currently muting a group, if any.
    #[must_use]
    pub fn group_muted(&self, route_id: &str, group_fp: Fingerprint) -> Vec<String> {
        self.inner
            .lock()
            .groups
            .get(&(route_id.to_owned(), group_fp))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop a group's marker entry when the group is destroyed.
    pub fn delete_group(&self, route_id: &str, group_fp: Fingerprint) {
        self.inner.lock().groups.remove(&(route_id.to_owned(), group_fp));
    }

    /// Number of alerts currently in the given state.
    #[must_use]
    pub fn count(&self, state: AlertState) -> usize {
        self.inner
            .lock()
            .alerts
            .values()
            .filter(|s| s.state == state)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use klaxon_core::LabelSet;

    use super::*;

    fn fp(service: &str) -> Fingerprint {
        LabelSet::from([("service", service)]).fingerprint()
    }

    #[test]
    fn silenced_then_cleared() {
        let marker = Marker::new();
        let fp = fp("api");

        marker.set_silenced(fp, vec!["sil-1".into()]);
        assert!(marker.muted(fp));
        assert_eq!(marker.status(fp).silenced_by, vec!["sil-1".to_owned()]);

        marker.set_silenced(fp, Vec::new());
        assert!(!marker.muted(fp));
        assert_eq!(marker.status(fp).state, AlertState::Active);
    }

    #[test]
    fn inhibited_and_silenced_are_independent() {
        let marker = Marker::new();
        let target = fp("warning");
        let source = fp("critical");

        marker.set_inhibited(target, vec![source]);
        marker.set_silenced(target, vec!["sil-1".into()]);

        marker.set_silenced(target, Vec::new());
        assert!(marker.muted(target), "still inhibited");

        marker.set_inhibited(target, Vec::new());
        assert!(!marker.muted(target));
    }

    #[test]
    fn unknown_alert_is_unprocessed() {
        let marker = Marker::new();
        assert_eq!(marker.status(fp("x")).state, AlertState::Unprocessed);
        assert!(!marker.muted(fp("x")));
    }

    #[test]
    fn group_mute_round_trip() {
        let marker = Marker::new();
        let group = fp("group");

        marker.set_group_muted("{}", group, vec!["weekends".into()]);
        assert_eq!(marker.group_muted("{}", group), vec!["weekends".to_owned()]);
        assert!(marker.group_muted("{}/0", group).is_empty());

        marker.delete_group("{}", group);
        assert!(marker.group_muted("{}", group).is_empty());
    }

    #[test]
    fn counts_by_state() {
        let marker = Marker::new();
        marker.set_silenced(fp("a"), vec!["s".into()]);
        marker.set_silenced(fp("b"), Vec::new());
        assert_eq!(marker.count(AlertState::Suppressed), 1);
        assert_eq!(marker.count(AlertState::Active), 1);
    }
}
