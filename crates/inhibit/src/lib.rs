//! Alerts muting other alerts.
//!
//! An inhibit rule lets a firing *source* alert (say, a whole-cluster
//! outage) mute *target* alerts (per-service warnings) that agree with it
//! on a set of `equal` labels. The [`Inhibitor`] evaluates the configured
//! rules against the pending alerts in the store and records which source
//! fingerprints are muting each target.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use klaxon_core::{Fingerprint, LabelSet, Matchers};
use klaxon_store::{AlertStore, Marker};

/// One inhibition rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InhibitRule {
    /// Matchers a muting source alert must satisfy.
    pub source_matchers: Matchers,

    /// Matchers a muted target alert must satisfy.
    pub target_matchers: Matchers,

    /// Labels that must be equal between source and target for the rule
    /// to apply. A label absent on both sides counts as equal.
    #[serde(default)]
    pub equal: Vec<String>,
}

impl InhibitRule {
    /// Build a rule from its three parts.
    #[must_use]
    pub fn new(
        source_matchers: Matchers,
        target_matchers: Matchers,
        equal: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            source_matchers,
            target_matchers,
            equal: equal.into_iter().map(Into::into).collect(),
        }
    }

    fn equal_labels_match(&self, source: &LabelSet, target: &LabelSet) -> bool {
        self.equal
            .iter()
            .all(|name| source.get(name).unwrap_or("") == target.get(name).unwrap_or(""))
    }
}

/// Evaluates inhibit rules against the alert store.
pub struct Inhibitor {
    rules: Vec<InhibitRule>,
    store: Arc<AlertStore>,
    marker: Arc<Marker>,
}

impl Inhibitor {
    /// Create an inhibitor over the given rules.
    #[must_use]
    pub fn new(rules: Vec<InhibitRule>, store: Arc<AlertStore>, marker: Arc<Marker>) -> Self {
        Self {
            rules,
            store,
            marker,
        }
    }

    /// The configured rules.
    #[must_use]
    pub fn rules(&self) -> &[InhibitRule] {
        &self.rules
    }

    /// Whether any rule mutes the label set right now.
    ///
    /// Walks the store's pending alerts looking for an active source. An
    /// alert that itself matches a rule's source matchers is never
    /// inhibited by that rule, so a source cannot mute itself or its
    /// peers. The muting source fingerprints are recorded in the marker
    /// for the admin surface.
    #[must_use]
    pub fn mutes(&self, labels: &LabelSet) -> bool {
        let fp = labels.fingerprint();
        let now = Utc::now();

        let mut sources: Vec<Fingerprint> = Vec::new();
        let mut pending: Option<Vec<klaxon_core::Alert>> = None;

        for rule in &self.rules {
            if !rule.target_matchers.matches(labels) {
                continue;
            }
            if rule.source_matchers.matches(labels) {
                continue;
            }
            // Fetched lazily so rule evaluation without a target match
            // never snapshots the store.
            let alerts = pending.get_or_insert_with(|| self.store.pending());
            for alert in alerts.iter() {
                if alert.resolved_at(now) {
                    continue;
                }
                if rule.source_matchers.matches(&alert.labels)
                    && rule.equal_labels_match(&alert.labels, labels)
                {
                    sources.push(alert.fingerprint());
                }
            }
        }

        sources.sort_unstable();
        sources.dedup();
        let muted = !sources.is_empty();
        if muted {
            debug!(target = %labels, sources = sources.len(), "alert inhibited");
        }
        self.marker.set_inhibited(fp, sources);
        muted
    }
}

#[cfg(test)]
mod tests {
    use klaxon_core::{Alert, MatchOperator, Matcher};
    use klaxon_store::StoreConfig;

    use super::*;

    fn matchers(name: &str, value: &str) -> Matchers {
        [Matcher::new(name, MatchOperator::Equal, value).unwrap()]
            .into_iter()
            .collect()
    }

    fn rule() -> InhibitRule {
        InhibitRule::new(
            matchers("severity", "critical"),
            matchers("severity", "warning"),
            ["cluster"],
        )
    }

    fn setup(rules: Vec<InhibitRule>) -> (Arc<AlertStore>, Arc<Marker>, Inhibitor) {
        let store = Arc::new(AlertStore::new(StoreConfig::default()));
        let marker = Arc::new(Marker::new());
        let inhibitor = Inhibitor::new(rules, Arc::clone(&store), Arc::clone(&marker));
        (store, marker, inhibitor)
    }

    fn alert(severity: &str, cluster: &str) -> Alert {
        Alert::new(LabelSet::from([
            ("alertname", "Check"),
            ("severity", severity),
            ("cluster", cluster),
        ]))
    }

    #[test]
    fn source_mutes_matching_target() {
        let (store, marker, inhibitor) = setup(vec![rule()]);
        store.put([alert("critical", "c1")]).unwrap();

        let target = alert("warning", "c1").labels;
        assert!(inhibitor.mutes(&target));

        let status = marker.status(target.fingerprint());
        assert_eq!(
            status.inhibited_by,
            vec![alert("critical", "c1").fingerprint()]
        );
    }

    #[test]
    fn equal_label_mismatch_does_not_mute() {
        let (store, _, inhibitor) = setup(vec![rule()]);
        store.put([alert("critical", "c1")]).unwrap();

        let other_cluster = alert("warning", "c2").labels;
        assert!(!inhibitor.mutes(&other_cluster));
    }

    #[test]
    fn resolved_source_does_not_mute() {
        let (store, _, inhibitor) = setup(vec![rule()]);
        store
            .put([alert("critical", "c1")
                .with_ends_at(Utc::now() - chrono::Duration::seconds(1))])
            .unwrap();

        assert!(!inhibitor.mutes(&alert("warning", "c1").labels));
    }

    #[test]
    fn source_is_never_inhibited_by_its_own_rule() {
        // Rule where sources are also targets: severity=critical mutes
        // everything in the cluster, including other criticals.
        let broad = InhibitRule::new(
            matchers("severity", "critical"),
            Matchers::default(),
            ["cluster"],
        );
        let (store, _, inhibitor) = setup(vec![broad]);
        store.put([alert("critical", "c1")]).unwrap();

        assert!(
            !inhibitor.mutes(&alert("critical", "c1").labels),
            "a source must not inhibit itself or fellow sources"
        );
        assert!(inhibitor.mutes(&alert("warning", "c1").labels));
    }

    #[test]
    fn clearing_marker_when_no_longer_muted() {
        let (store, marker, inhibitor) = setup(vec![rule()]);
        store.put([alert("critical", "c1")]).unwrap();

        let target = alert("warning", "c1").labels;
        assert!(inhibitor.mutes(&target));
        assert!(marker.muted(target.fingerprint()));

        // Source resolves; re-evaluation clears the marker.
        store
            .put([alert("critical", "c1")
                .with_ends_at(Utc::now() - chrono::Duration::seconds(1))])
            .unwrap();
        assert!(!inhibitor.mutes(&target));
        assert!(!marker.muted(target.fingerprint()));
    }

    #[test]
    fn absent_equal_labels_on_both_sides_count_as_equal() {
        let no_cluster_rule = InhibitRule::new(
            matchers("severity", "critical"),
            matchers("severity", "warning"),
            ["datacenter"],
        );
        let (store, _, inhibitor) = setup(vec![no_cluster_rule]);
        store.put([alert("critical", "c1")]).unwrap();

        // Neither alert has a datacenter label.
        assert!(inhibitor.mutes(&alert("warning", "c9").labels));
    }

    #[test]
    fn rule_serde_round_trip() {
        let json = serde_json::to_string(&rule()).unwrap();
        let back: InhibitRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.equal, vec!["cluster".to_owned()]);
        assert_eq!(back.source_matchers, rule().source_matchers);
    }
}
