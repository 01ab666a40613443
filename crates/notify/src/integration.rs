//! The integration seam.
//!
//! Receiver protocols live outside the core; the pipeline only needs an
//! object-safe send operation and a resolved-send policy.

use std::sync::Arc;

use async_trait::async_trait;

use klaxon_core::Alert;

use crate::context::FlushContext;
use crate::error::IntegrationError;

/// One way of delivering a notification (an email account, a chat
/// webhook, a paging service).
#[async_trait]
pub trait Integration: Send + Sync {
    /// Unique name within its receiver.
    fn name(&self) -> &str;

    /// Deliver one notification for the given alert batch.
    async fn send(&self, ctx: &FlushContext, alerts: &[Alert]) -> Result<(), IntegrationError>;

    /// Whether this integration wants resolved notifications. Batches
    /// containing only resolved alerts are skipped when `false`.
    fn sends_resolved(&self) -> bool {
        true
    }
}

/// A named group of integrations that notifications fan out to.
#[derive(Clone)]
pub struct Receiver {
    name: String,
    integrations: Vec<Arc<dyn Integration>>,
}

impl Receiver {
    /// A receiver with no integrations (notifications are dropped
    /// successfully, useful as a blackhole default).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            integrations: Vec::new(),
        }
    }

    /// Add an integration.
    #[must_use]
    pub fn integration(mut self, integration: Arc<dyn Integration>) -> Self {
        self.integrations.push(integration);
        self
    }

    /// The receiver's name, referenced by routes.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The integrations in declaration order.
    #[must_use]
    pub fn integrations(&self) -> &[Arc<dyn Integration>] {
        &self.integrations
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("integrations", &self.integrations.len())
            .finish()
    }
}
