//! The alert model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::labels::{Fingerprint, LabelSet};

/// An alert received from a monitoring producer.
///
/// Identity is the fingerprint of the label set; annotations and
/// timestamps carry no identity. `ends_at == None` means the alert is
/// firing with no known end; the store assigns an effective end on
/// ingestion from its resolve timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Identifying labels.
    pub labels: LabelSet,

    /// Free-form annotations (descriptions, runbook links, ...).
    #[serde(default)]
    pub annotations: LabelSet,

    /// When the condition started firing. Zero-valued input is replaced
    /// with the ingestion time by the store.
    #[serde(default = "epoch", rename = "startsAt")]
    pub starts_at: DateTime<Utc>,

    /// When the condition ended, if known.
    #[serde(default, rename = "endsAt", skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,

    /// URL of the producer entity that generated this alert.
    #[serde(default, rename = "generatorURL", skip_serializing_if = "String::is_empty")]
    pub generator_url: String,

    /// When this payload was last received. Maintained by the store.
    #[serde(default = "epoch", rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,

    /// Whether `ends_at` was assigned by the resolve timeout rather than
    /// supplied by the producer.
    #[serde(skip)]
    pub timeout: bool,
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl Alert {
    /// Create a firing alert from labels, with all timestamps unset.
    #[must_use]
    pub fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            annotations: LabelSet::new(),
            starts_at: epoch(),
            ends_at: None,
            generator_url: String::new(),
            updated_at: epoch(),
            timeout: false,
        }
    }

    /// Set annotations.
    #[must_use]
    pub fn with_annotations(mut self, annotations: LabelSet) -> Self {
        self.annotations = annotations;
        self
    }

    /// Set the start time.
    #[must_use]
    pub fn with_starts_at(mut self, at: DateTime<Utc>) -> Self {
        self.starts_at = at;
        self
    }

    /// Set the end time.
    #[must_use]
    pub fn with_ends_at(mut self, at: DateTime<Utc>) -> Self {
        self.ends_at = Some(at);
        self
    }

    /// The identity of this alert.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.labels.fingerprint()
    }

    /// Whether the alert is resolved as of `now`.
    ///
    /// Flush snapshots evaluate this against the flush's fixed `now` so a
    /// slow delivery cannot flip an alert's state mid-pipeline.
    #[must_use]
    pub fn resolved_at(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|e| e <= now)
    }

    /// Status string for logs and admin snapshots.
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> &'static str {
        if self.resolved_at(now) { "resolved" } else { "firing" }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn labels() -> LabelSet {
        LabelSet::from([("alertname", "HighLatency"), ("service", "api")])
    }

    #[test]
    fn firing_without_end() {
        let alert = Alert::new(labels());
        assert!(!alert.resolved_at(Utc::now()));
        assert_eq!(alert.status_at(Utc::now()), "firing");
    }

    #[test]
    fn resolved_when_end_passed() {
        let now = Utc::now();
        let alert = Alert::new(labels()).with_ends_at(now - Duration::seconds(1));
        assert!(alert.resolved_at(now));

        let future = Alert::new(labels()).with_ends_at(now + Duration::seconds(30));
        assert!(!future.resolved_at(now));
    }

    #[test]
    fn end_exactly_now_is_resolved() {
        let now = Utc::now();
        let alert = Alert::new(labels()).with_ends_at(now);
        assert!(alert.resolved_at(now));
    }

    #[test]
    fn fingerprint_tracks_labels_only() {
        let a = Alert::new(labels()).with_annotations(LabelSet::from([("summary", "x")]));
        let b = Alert::new(labels());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn deserializes_producer_payload() {
        let json = r#"{
            "labels": {"alertname": "Up", "service": "api"},
            "annotations": {"summary": "it is up"},
            "startsAt": "2026-01-01T00:00:00Z"
        }"#;
        let alert: Alert = serde_json::from_str(json).unwrap();
        assert_eq!(alert.labels.get("alertname"), Some("Up"));
        assert!(alert.ends_at.is_none());
    }
}
