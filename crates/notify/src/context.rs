//! The per-flush context handed to every stage.

use std::time::Duration;

use chrono::{DateTime, Utc};

use klaxon_core::{LabelSet, Route};

/// Immutable facts about one flush.
///
/// `now` is fixed when the flush starts; every stage evaluates
/// resolved-ness and interval membership against it so a slow stage
/// cannot change what the flush means.
#[derive(Debug, Clone)]
pub struct FlushContext {
    pub now: DateTime<Utc>,
    pub group_key: String,
    pub group_labels: LabelSet,
    pub route_id: String,
    pub receiver: String,
    pub repeat_interval: Duration,
    /// Time budget for the retry stage, the route's group interval: a
    /// send still failing at the next flush opportunity is abandoned and
    /// retried by that flush instead.
    pub flush_budget: Duration,
    pub mute_time_intervals: Vec<String>,
    pub active_time_intervals: Vec<String>,
}

impl FlushContext {
    /// Build the context for a flush of `group_labels` at `route`.
    #[must_use]
    pub fn for_route(route: &Route, group_labels: LabelSet, now: DateTime<Utc>) -> Self {
        let group_key = format!("{}/{}", route.id(), group_labels);
        Self {
            now,
            group_key,
            group_labels,
            route_id: route.id().to_owned(),
            receiver: route.receiver().to_owned(),
            repeat_interval: route.opts().repeat_interval,
            flush_budget: route.opts().group_interval,
            mute_time_intervals: route.opts().mute_time_intervals.clone(),
            active_time_intervals: route.opts().active_time_intervals.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use klaxon_core::RouteConfig;

    use super::*;

    #[test]
    fn group_key_combines_route_and_labels() {
        let route = RouteConfig::with_receiver("pager")
            .group_by(["service"])
            .compile()
            .unwrap();
        let labels = LabelSet::from([("service", "api")]);
        let ctx = FlushContext::for_route(&route, labels, Utc::now());
        assert_eq!(ctx.group_key, r#"{}/{service="api"}"#);
        assert_eq!(ctx.receiver, "pager");
    }
}
