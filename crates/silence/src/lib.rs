//! The silence engine.
//!
//! Silences are matcher-based, time-bounded mutes, created by operators
//! and gossiped across the cluster. The engine answers the pipeline's
//! "which active silences mute this label set" query and persists its
//! state in a length-delimited protobuf snapshot.

pub mod engine;
pub mod error;
pub mod proto;
pub mod types;

pub use engine::{SilenceConfig, SilenceMetrics, Silences};
pub use error::SilenceError;
pub use types::{QueryFilter, Silence, SilenceState};
