//! Silence records and query filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use klaxon_core::{LabelSet, Matchers, ValidationError};

/// Lifecycle state of a silence at a point in time.
///
/// Transitions are time-driven: `pending -> active -> expired`, and
/// expiry is monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SilenceState {
    Pending,
    Active,
    Expired,
}

/// A matcher-based, time-bounded mute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Silence {
    /// Assigned by the engine on creation; rotated when an update cannot
    /// be applied in place.
    #[serde(default)]
    pub id: String,

    /// Conjunction of matchers; a label set is muted iff all match.
    pub matchers: Matchers,

    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,

    #[serde(rename = "endsAt")]
    pub ends_at: DateTime<Utc>,

    #[serde(rename = "createdBy", default)]
    pub created_by: String,

    #[serde(default)]
    pub comment: String,

    /// Maintained by the engine; last-writer-wins key for gossip merges.
    #[serde(rename = "updatedAt", default = "unix_epoch")]
    pub updated_at: DateTime<Utc>,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl Silence {
    /// A new silence covering `[starts_at, ends_at)`.
    #[must_use]
    pub fn new(matchers: Matchers, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            matchers,
            starts_at,
            ends_at,
            created_by: String::new(),
            comment: String::new(),
            updated_at: DateTime::UNIX_EPOCH,
        }
    }

    /// Set the author.
    #[must_use]
    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = who.into();
        self
    }

    /// Set the comment.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// The silence's state as of `now`.
    #[must_use]
    pub fn state_at(&self, now: DateTime<Utc>) -> SilenceState {
        if self.ends_at <= now {
            SilenceState::Expired
        } else if self.starts_at <= now {
            SilenceState::Active
        } else {
            SilenceState::Pending
        }
    }

    /// Whether every matcher matches the label set.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.matchers.matches(labels)
    }

    /// Enforce the creation-time invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.matchers.is_empty() {
            return Err(ValidationError::NoMatchers);
        }
        if !self.matchers.iter().any(klaxon_core::Matcher::matches_non_empty) {
            return Err(ValidationError::AllMatchersMatchEmpty);
        }
        if self.starts_at >= self.ends_at {
            return Err(ValidationError::InvalidWindow);
        }
        Ok(())
    }
}

/// Predicates for [`Silences::query`](crate::Silences::query).
///
/// Unset fields match everything; set fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Restrict to these silence ids.
    pub ids: Option<Vec<String>>,
    /// Restrict to silences in one of these states (evaluated at query
    /// time).
    pub states: Option<Vec<SilenceState>>,
    /// Restrict to silences whose matchers match this label set.
    pub matches: Option<LabelSet>,
}

impl QueryFilter {
    /// Filter by id.
    #[must_use]
    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by state.
    #[must_use]
    pub fn states(mut self, states: impl IntoIterator<Item = SilenceState>) -> Self {
        self.states = Some(states.into_iter().collect());
        self
    }

    /// Filter by matched label set.
    #[must_use]
    pub fn matching(mut self, labels: LabelSet) -> Self {
        self.matches = Some(labels);
        self
    }

    pub(crate) fn accepts(&self, silence: &Silence, now: DateTime<Utc>) -> bool {
        if let Some(ids) = &self.ids
            && !ids.iter().any(|id| *id == silence.id)
        {
            return false;
        }
        if let Some(states) = &self.states
            && !states.contains(&silence.state_at(now))
        {
            return false;
        }
        if let Some(labels) = &self.matches
            && !silence.matches(labels)
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use klaxon_core::{MatchOperator, Matcher};

    use super::*;

    fn matchers() -> Matchers {
        [Matcher::new("service", MatchOperator::Equal, "api").unwrap()]
            .into_iter()
            .collect()
    }

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(offset_secs)
    }

    #[test]
    fn state_machine_is_time_driven() {
        let sil = Silence::new(matchers(), ts(60), ts(120));
        let now = Utc::now();
        assert_eq!(sil.state_at(now), SilenceState::Pending);
        assert_eq!(sil.state_at(now + chrono::Duration::seconds(90)), SilenceState::Active);
        assert_eq!(sil.state_at(now + chrono::Duration::seconds(180)), SilenceState::Expired);
    }

    #[test]
    fn start_boundary_is_active_end_boundary_is_expired() {
        let start = ts(0);
        let end = ts(60);
        let sil = Silence::new(matchers(), start, end);
        assert_eq!(sil.state_at(start), SilenceState::Active);
        assert_eq!(sil.state_at(end), SilenceState::Expired);
    }

    #[test]
    fn validation_rules() {
        assert!(matches!(
            Silence::new(Matchers::default(), ts(0), ts(60)).validate(),
            Err(ValidationError::NoMatchers)
        ));

        assert!(matches!(
            Silence::new(matchers(), ts(60), ts(0)).validate(),
            Err(ValidationError::InvalidWindow)
        ));

        let empty_only: Matchers = [Matcher::new("service", MatchOperator::Equal, "").unwrap()]
            .into_iter()
            .collect();
        assert!(matches!(
            Silence::new(empty_only, ts(0), ts(60)).validate(),
            Err(ValidationError::AllMatchersMatchEmpty)
        ));

        assert!(Silence::new(matchers(), ts(0), ts(60)).validate().is_ok());
    }

    #[test]
    fn silence_json_round_trip() {
        let mut sil = Silence::new(matchers(), ts(0), ts(300))
            .created_by("oncall")
            .comment("deploy window");
        sil.id = "test-id".into();
        sil.updated_at = Utc::now();

        let json = serde_json::to_string(&sil).unwrap();
        assert!(json.contains("startsAt"), "admin JSON uses camelCase: {json}");
        let back: Silence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sil);
    }

    #[test]
    fn filter_conjunction() {
        let now = Utc::now();
        let mut sil = Silence::new(matchers(), ts(-10), ts(60));
        sil.id = "s1".into();

        let labels = LabelSet::from([("service", "api")]);
        assert!(QueryFilter::default().accepts(&sil, now));
        assert!(QueryFilter::default().ids(["s1"]).accepts(&sil, now));
        assert!(!QueryFilter::default().ids(["other"]).accepts(&sil, now));
        assert!(
            QueryFilter::default()
                .states([SilenceState::Active])
                .accepts(&sil, now)
        );
        assert!(
            !QueryFilter::default()
                .states([SilenceState::Expired])
                .accepts(&sil, now)
        );
        assert!(QueryFilter::default().matching(labels).accepts(&sil, now));
        assert!(
            !QueryFilter::default()
                .matching(LabelSet::from([("service", "db")]))
                .accepts(&sil, now)
        );
    }
}
