//! Label sets and fingerprints.
//!
//! A label set is an ordered `name -> value` mapping. Its fingerprint is a
//! 64-bit hash over the sorted pairs, so two alerts carrying identical
//! labels always collapse onto the same identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::error::ValidationError;

/// Separator fed between label names and values while hashing, so that
/// `{"ab": "c"}` and `{"a": "bc"}` cannot collide.
const HASH_SEP: u8 = 0xfe;

/// A 64-bit identity hash of a label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// An ordered mapping of label names to values.
///
/// Backed by a `BTreeMap` so iteration order is the sorted name order the
/// fingerprint is defined over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Create an empty label set.
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert a label, returning the previous value if the name was present.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    /// Look up a label value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of labels in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set holds no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs in sorted name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The subset of this label set whose names appear in `names`.
    #[must_use]
    pub fn subset(&self, names: &[String]) -> LabelSet {
        let mut out = LabelSet::new();
        for name in names {
            if let Some(value) = self.0.get(name) {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }

    /// Compute the 64-bit fingerprint of the sorted label pairs.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Xxh3::new();
        for (name, value) in &self.0 {
            hasher.update(name.as_bytes());
            hasher.update(&[HASH_SEP]);
            hasher.update(value.as_bytes());
            hasher.update(&[HASH_SEP]);
        }
        Fingerprint(hasher.digest())
    }

    /// Reject empty names and empty values.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            return Err(ValidationError::EmptyLabelSet);
        }
        for (name, value) in &self.0 {
            if name.is_empty() {
                return Err(ValidationError::EmptyLabelName);
            }
            if value.is_empty() {
                return Err(ValidationError::EmptyLabelValue(name.clone()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, String)> for LabelSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for LabelSet {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_order_independent() {
        let mut a = LabelSet::new();
        a.insert("service", "api");
        a.insert("severity", "critical");

        let mut b = LabelSet::new();
        b.insert("severity", "critical");
        b.insert("service", "api");

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_on_value_change() {
        let a = LabelSet::from([("service", "api")]);
        let b = LabelSet::from([("service", "db")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_boundary_confusion() {
        let a = LabelSet::from([("ab", "c")]);
        let b = LabelSet::from([("a", "bc")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn subset_keeps_only_named_labels() {
        let labels = LabelSet::from([("service", "api"), ("instance", "i-1"), ("env", "prod")]);
        let sub = labels.subset(&["service".to_owned(), "env".to_owned()]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.get("service"), Some("api"));
        assert_eq!(sub.get("instance"), None);
    }

    #[test]
    fn display_is_sorted_and_quoted() {
        let labels = LabelSet::from([("b", "2"), ("a", "1")]);
        assert_eq!(labels.to_string(), r#"{a="1",b="2"}"#);
    }

    #[test]
    fn validate_rejects_empty() {
        assert!(matches!(
            LabelSet::new().validate(),
            Err(ValidationError::EmptyLabelSet)
        ));

        let mut labels = LabelSet::new();
        labels.insert("service", "");
        assert!(matches!(
            labels.validate(),
            Err(ValidationError::EmptyLabelValue(_))
        ));
    }

    #[test]
    fn serde_round_trip() {
        let labels = LabelSet::from([("service", "api"), ("severity", "warning")]);
        let json = serde_json::to_string(&labels).unwrap();
        assert_eq!(json, r#"{"service":"api","severity":"warning"}"#);
        let back: LabelSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, labels);
    }
}
