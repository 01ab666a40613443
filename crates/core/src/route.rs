//! The routing tree.
//!
//! A route tree is configured as a [`RouteConfig`] value and compiled into
//! an immutable [`Route`] tree. Children inherit every unset option from
//! their parent at compile time, so matching never needs to walk back up.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::labels::LabelSet;
use crate::matcher::{Matcher, Matchers};

/// Label-set reduction applied at a matched route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBy {
    /// Group by the full label set (configured as `["..."]`).
    All,
    /// Group by the named labels only.
    Labels(Vec<String>),
}

/// Timing and muting options carried by a compiled route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOpts {
    /// How long a fresh group buffers its first notification.
    pub group_wait: Duration,
    /// Delay between flushes of an established group.
    pub group_interval: Duration,
    /// Minimum interval before an unchanged group is re-notified.
    pub repeat_interval: Duration,
    /// Named time intervals during which this route is muted.
    pub mute_time_intervals: Vec<String>,
    /// Named time intervals outside of which this route is muted.
    pub active_time_intervals: Vec<String>,
}

impl Default for RouteOpts {
    fn default() -> Self {
        Self {
            group_wait: Duration::from_secs(30),
            group_interval: Duration::from_secs(5 * 60),
            repeat_interval: Duration::from_secs(4 * 60 * 60),
            mute_time_intervals: Vec::new(),
            active_time_intervals: Vec::new(),
        }
    }
}

/// Declarative route-tree node, prior to compilation.
///
/// Unset options inherit from the parent; the root falls back to the
/// [`RouteOpts`] defaults. Duration fields are milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Receiver name. Required on the root, inherited below.
    pub receiver: Option<String>,

    /// Matchers an alert must satisfy to enter this node.
    pub matchers: Vec<Matcher>,

    /// Labels to group by; the single entry `"..."` selects all labels.
    pub group_by: Option<Vec<String>>,

    pub group_wait_ms: Option<u64>,
    pub group_interval_ms: Option<u64>,
    pub repeat_interval_ms: Option<u64>,

    pub mute_time_intervals: Option<Vec<String>>,
    pub active_time_intervals: Option<Vec<String>>,

    /// Keep evaluating siblings after this node matched.
    #[serde(rename = "continue")]
    pub continue_matching: bool,

    pub routes: Vec<RouteConfig>,
}

impl RouteConfig {
    /// A config node with the given receiver and no matchers.
    #[must_use]
    pub fn with_receiver(receiver: impl Into<String>) -> Self {
        Self {
            receiver: Some(receiver.into()),
            ..Self::default()
        }
    }

    /// Set matchers.
    #[must_use]
    pub fn matchers(mut self, matchers: Vec<Matcher>) -> Self {
        self.matchers = matchers;
        self
    }

    /// Set the grouping labels.
    #[must_use]
    pub fn group_by(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.group_by = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Set the group-wait duration.
    #[must_use]
    pub fn group_wait(mut self, d: Duration) -> Self {
        self.group_wait_ms = Some(u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the group-interval duration.
    #[must_use]
    pub fn group_interval(mut self, d: Duration) -> Self {
        self.group_interval_ms = Some(u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the repeat-interval duration.
    #[must_use]
    pub fn repeat_interval(mut self, d: Duration) -> Self {
        self.repeat_interval_ms = Some(u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Add a child route.
    #[must_use]
    pub fn route(mut self, child: RouteConfig) -> Self {
        self.routes.push(child);
        self
    }

    /// Mark this node as `continue`.
    #[must_use]
    pub fn continues(mut self) -> Self {
        self.continue_matching = true;
        self
    }

    /// Compile the tree, applying inheritance and validating receivers.
    pub fn compile(&self) -> Result<Route, ValidationError> {
        Route::compile_node(self, None, "{}")
    }
}

/// A compiled routing-tree node.
#[derive(Debug, Clone)]
pub struct Route {
    id: String,
    receiver: String,
    matchers: Matchers,
    group_by: GroupBy,
    opts: RouteOpts,
    continue_matching: bool,
    children: Vec<Route>,
}

impl Route {
    fn compile_node(
        config: &RouteConfig,
        parent: Option<&Route>,
        id: &str,
    ) -> Result<Route, ValidationError> {
        let receiver = match (&config.receiver, parent) {
            (Some(r), _) => r.clone(),
            (None, Some(p)) => p.receiver.clone(),
            (None, None) => {
                return Err(ValidationError::InvalidRoute(
                    id.to_owned(),
                    "root route must name a receiver".to_owned(),
                ));
            }
        };

        let group_by = match &config.group_by {
            Some(labels) if labels.iter().any(|l| l == "...") => GroupBy::All,
            Some(labels) => GroupBy::Labels(labels.clone()),
            None => parent.map_or(GroupBy::Labels(Vec::new()), |p| p.group_by.clone()),
        };

        let inherited = parent.map_or_else(RouteOpts::default, |p| p.opts.clone());
        let opts = RouteOpts {
            group_wait: config
                .group_wait_ms
                .map_or(inherited.group_wait, Duration::from_millis),
            group_interval: config
                .group_interval_ms
                .map_or(inherited.group_interval, Duration::from_millis),
            repeat_interval: config
                .repeat_interval_ms
                .map_or(inherited.repeat_interval, Duration::from_millis),
            mute_time_intervals: config
                .mute_time_intervals
                .clone()
                .unwrap_or(inherited.mute_time_intervals),
            active_time_intervals: config
                .active_time_intervals
                .clone()
                .unwrap_or(inherited.active_time_intervals),
        };

        let mut node = Route {
            id: id.to_owned(),
            receiver,
            matchers: config.matchers.iter().cloned().collect(),
            group_by,
            opts,
            continue_matching: config.continue_matching,
            children: Vec::new(),
        };

        let mut children = Vec::with_capacity(config.routes.len());
        for (idx, child) in config.routes.iter().enumerate() {
            let child_id = format!("{id}/{idx}:{{{}}}", Matchers(child.matchers.clone()));
            children.push(Self::compile_node(child, Some(&node), &child_id)?);
        }
        node.children = children;
        Ok(node)
    }

    /// Stable identifier derived from the node's path in the tree.
    ///
    /// Used as the route key in markers, group keys and log entries.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The receiver notifications from this route go to.
    #[must_use]
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// Timing and muting options.
    #[must_use]
    pub fn opts(&self) -> &RouteOpts {
        &self.opts
    }

    /// Child routes in declaration order.
    #[must_use]
    pub fn children(&self) -> &[Route] {
        &self.children
    }

    /// Depth-first match: returns every route the alert is dispatched to.
    ///
    /// At each node the children are tried in declared order; a matching
    /// child without `continue` stops sibling traversal. A node whose
    /// children all miss matches itself.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> Vec<&Route> {
        let mut out = Vec::new();
        self.match_into(labels, &mut out);
        out
    }

    fn match_into<'a>(&'a self, labels: &LabelSet, out: &mut Vec<&'a Route>) -> bool {
        if !self.matchers.matches(labels) {
            return false;
        }
        let mut any_child = false;
        for child in &self.children {
            if child.match_into(labels, out) {
                any_child = true;
                if !child.continue_matching {
                    break;
                }
            }
        }
        if !any_child {
            out.push(self);
        }
        true
    }

    /// The group labels of an alert at this route.
    #[must_use]
    pub fn group_labels(&self, labels: &LabelSet) -> LabelSet {
        match &self.group_by {
            GroupBy::All => labels.clone(),
            GroupBy::Labels(names) => labels.subset(names),
        }
    }

    /// Walk the whole tree, yielding every node.
    pub fn walk(&self, visit: &mut impl FnMut(&Route)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}
