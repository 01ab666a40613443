//! The notification log.
//!
//! A gossiped last-writer-wins map recording, per (group key, receiver),
//! when a notification was last sent and for which set of alerts. Peers
//! merge each other's logs so a notification one peer already sent is
//! suppressed everywhere.

pub mod error;
pub mod log;
pub mod proto;

pub use error::NflogError;
pub use log::{Nflog, NflogConfig, NflogMetrics};
pub use proto::Entry;
