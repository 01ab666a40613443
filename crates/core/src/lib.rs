//! Core data model for the Klaxon alert router.
//!
//! This crate defines the label-set and alert types shared by every
//! subsystem, the matcher syntax used by silences, inhibit rules and
//! routes, the routing tree itself, and mute/active time intervals.

pub mod alert;
pub mod error;
pub mod labels;
pub mod matcher;
pub mod route;
pub mod timeinterval;

pub use alert::Alert;
pub use error::ValidationError;
pub use labels::{Fingerprint, LabelSet};
pub use matcher::{MatchOperator, Matcher, Matchers};
pub use route::{GroupBy, Route, RouteConfig, RouteOpts};
pub use timeinterval::{DayOfMonthRange, TimeInterval, TimeOfDayRange, TimeRange, WeekdayRange};
