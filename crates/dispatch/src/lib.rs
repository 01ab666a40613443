//! Alert dispatch.
//!
//! The dispatcher consumes the alert stream, routes each alert through
//! the routing tree, and maintains one aggregation group per (route,
//! group labels) pair. Each group runs its own scheduler task that
//! buffers the first notification for `group_wait` and re-flushes every
//! `group_interval` thereafter.

pub mod dispatcher;
pub mod group;

pub use dispatcher::{AlertGroup, DispatchMetrics, Dispatcher, DispatcherConfig};
pub use group::AggrGroup;
