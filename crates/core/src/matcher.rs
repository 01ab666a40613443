//! Label matchers.
//!
//! Matchers are the predicate language shared by silences, inhibit rules
//! and the routing tree: `name="value"`, `name!="value"`, `name=~"regex"`,
//! `name!~"regex"`. Regex matchers are anchored to the full string.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;
use crate::labels::LabelSet;

/// The comparison a matcher applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOperator {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl MatchOperator {
    /// The operator token as written in matcher syntax.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        }
    }
}

/// A single label predicate.
#[derive(Debug, Clone)]
pub struct Matcher {
    name: String,
    op: MatchOperator,
    value: String,
    // Compiled, anchored pattern. Present iff op is a regex operator.
    re: Option<Regex>,
}

impl Matcher {
    /// Build a matcher, compiling and anchoring the regex for `=~`/`!~`.
    pub fn new(
        name: impl Into<String>,
        op: MatchOperator,
        value: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() {
            return Err(ValidationError::EmptyLabelName);
        }
        let re = match op {
            MatchOperator::Regex | MatchOperator::NotRegex => {
                let anchored = format!("^(?:{value})$");
                Some(
                    Regex::new(&anchored).map_err(|source| ValidationError::InvalidRegex {
                        name: name.clone(),
                        source,
                    })?,
                )
            }
            MatchOperator::Equal | MatchOperator::NotEqual => None,
        };
        Ok(Self {
            name,
            op,
            value,
            re,
        })
    }

    /// The label name this matcher applies to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The operator.
    #[must_use]
    pub fn op(&self) -> MatchOperator {
        self.op
    }

    /// The right-hand side (literal value or regex source).
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether this matcher matches the given label set.
    ///
    /// A label absent from the set matches as the empty string, so
    /// `env!="prod"` matches alerts that carry no `env` label at all.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        let v = labels.get(&self.name).unwrap_or("");
        match self.op {
            MatchOperator::Equal => v == self.value,
            MatchOperator::NotEqual => v != self.value,
            MatchOperator::Regex => self.re.as_ref().is_some_and(|re| re.is_match(v)),
            MatchOperator::NotRegex => !self.re.as_ref().is_some_and(|re| re.is_match(v)),
        }
    }

    /// Whether this matcher would match some non-empty string.
    ///
    /// Used by silence validation to reject silences that only match the
    /// empty label set.
    #[must_use]
    pub fn matches_non_empty(&self) -> bool {
        match self.op {
            MatchOperator::Equal => !self.value.is_empty(),
            MatchOperator::NotEqual | MatchOperator::NotRegex => true,
            MatchOperator::Regex => !self.value.is_empty() && self.value != "^$",
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op.as_str(), self.value)
    }
}

impl FromStr for Matcher {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Scan for the first operator token; `!=`/`=~`/`!~` before `=` so
        // the two-character forms win.
        let invalid = || ValidationError::InvalidMatcher(s.to_owned());
        let (idx, op) = ["!=", "=~", "!~", "="]
            .iter()
            .filter_map(|tok| s.find(tok).map(|i| (i, *tok)))
            .min_by_key(|(i, tok)| (*i, tok.len() == 1))
            .ok_or_else(invalid)?;
        let op = match op {
            "=" => MatchOperator::Equal,
            "!=" => MatchOperator::NotEqual,
            "=~" => MatchOperator::Regex,
            "!~" => MatchOperator::NotRegex,
            _ => unreachable!(),
        };
        let name = s[..idx].trim();
        let mut value = s[idx + op.as_str().len()..].trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }
        if name.is_empty() {
            return Err(invalid());
        }
        Matcher::new(name, op, value)
    }
}

impl Serialize for Matcher {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Matcher {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// An ordered conjunction of matchers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Matchers(pub Vec<Matcher>);

impl Matchers {
    /// Whether every matcher matches the label set. An empty conjunction
    /// matches everything.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.0.iter().all(|m| m.matches(labels))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Matcher> {
        self.0.iter()
    }
}

impl FromIterator<Matcher> for Matchers {
    fn from_iter<T: IntoIterator<Item = Matcher>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Matchers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, m) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{m}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> LabelSet {
        LabelSet::from([("service", "api"), ("severity", "critical")])
    }

    #[test]
    fn equal_and_not_equal() {
        let eq = Matcher::new("service", MatchOperator::Equal, "api").unwrap();
        assert!(eq.matches(&labels()));

        let ne = Matcher::new("service", MatchOperator::NotEqual, "db").unwrap();
        assert!(ne.matches(&labels()));

        let ne_miss = Matcher::new("service", MatchOperator::NotEqual, "api").unwrap();
        assert!(!ne_miss.matches(&labels()));
    }

    #[test]
    fn missing_label_matches_as_empty() {
        let ne = Matcher::new("env", MatchOperator::NotEqual, "prod").unwrap();
        assert!(ne.matches(&labels()));

        let eq_empty = Matcher::new("env", MatchOperator::Equal, "").unwrap();
        assert!(eq_empty.matches(&labels()));
    }

    #[test]
    fn regex_is_full_string_anchored() {
        let re = Matcher::new("service", MatchOperator::Regex, "ap").unwrap();
        assert!(!re.matches(&labels()), "partial match must not count");

        let re_full = Matcher::new("service", MatchOperator::Regex, "ap.*").unwrap();
        assert!(re_full.matches(&labels()));

        let nre = Matcher::new("service", MatchOperator::NotRegex, "db|cache").unwrap();
        assert!(nre.matches(&labels()));
    }

    #[test]
    fn invalid_regex_rejected() {
        let err = Matcher::new("service", MatchOperator::Regex, "(unclosed").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRegex { .. }));
    }

    #[test]
    fn parse_all_operators() {
        let cases = [
            (r#"service="api""#, MatchOperator::Equal),
            (r#"service!="api""#, MatchOperator::NotEqual),
            (r#"service=~"api|db""#, MatchOperator::Regex),
            (r#"service!~"api|db""#, MatchOperator::NotRegex),
        ];
        for (input, op) in cases {
            let m: Matcher = input.parse().unwrap();
            assert_eq!(m.op(), op, "{input}");
            assert_eq!(m.name(), "service");
        }
    }

    #[test]
    fn parse_unquoted_value() {
        let m: Matcher = "severity=critical".parse().unwrap();
        assert_eq!(m.value(), "critical");
        assert!(m.matches(&labels()));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("no-operator-here".parse::<Matcher>().is_err());
        assert!(r#"="value""#.parse::<Matcher>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let m: Matcher = r#"service=~"api|db""#.parse().unwrap();
        let again: Matcher = m.to_string().parse().unwrap();
        assert_eq!(m, again);
    }

    #[test]
    fn serde_uses_string_syntax() {
        let m: Matcher = r#"severity!="info""#.parse().unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#""severity!=\"info\"""#);
        let back: Matcher = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn matchers_conjunction() {
        let ms: Matchers = [
            Matcher::new("service", MatchOperator::Equal, "api").unwrap(),
            Matcher::new("severity", MatchOperator::Regex, "critical|warning").unwrap(),
        ]
        .into_iter()
        .collect();
        assert!(ms.matches(&labels()));

        let mut miss = labels();
        miss.insert("severity", "info");
        assert!(!ms.matches(&miss));
    }

    #[test]
    fn matches_non_empty() {
        let eq = Matcher::new("a", MatchOperator::Equal, "x").unwrap();
        assert!(eq.matches_non_empty());
        let eq_empty = Matcher::new("a", MatchOperator::Equal, "").unwrap();
        assert!(!eq_empty.matches_non_empty());
        let ne = Matcher::new("a", MatchOperator::NotEqual, "").unwrap();
        assert!(ne.matches_non_empty());
    }
}
