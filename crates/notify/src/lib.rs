//! The notification pipeline.
//!
//! A flush hands the pipeline a context and a batch of alerts; the
//! pipeline mutes what silences, inhibitions and time intervals say to
//! mute, waits out this peer's cluster position, deduplicates against the
//! notification log, and drives the receiver's integrations with retries.
//! A flush succeeds only when every stage succeeded; only then is the
//! notification log advanced.

pub mod context;
pub mod error;
pub mod integration;
pub mod pipeline;
pub mod retry;
pub mod stages;

pub use context::FlushContext;
pub use error::{IntegrationError, NotifyError};
pub use integration::{Integration, Receiver};
pub use pipeline::{NotifyMetrics, Pipeline, PipelineBuilder, Stage};
pub use retry::SendBackoff;
pub use stages::group_hash;
