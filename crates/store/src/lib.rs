//! In-memory alert storage for the Klaxon alert router.
//!
//! The [`AlertStore`] owns the current set of alerts keyed by fingerprint
//! and fans updates out to subscribers; the [`Marker`] registry tracks why
//! an alert is currently muted so admin surfaces can report it.

pub mod error;
pub mod marker;
pub mod store;

pub use error::StoreError;
pub use marker::{AlertState, AlertStatus, Marker};
pub use store::{AlertStore, AlertSubscription, StoreConfig};
