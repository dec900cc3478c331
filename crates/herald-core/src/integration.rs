//! The delivery-integration seam.
//!
//! Concrete integrations (webhook, log) live in the server crate; this
//! module only defines the traits the engine contract needs. Building
//! an integration from its configuration is where per-kind structural
//! validation happens — a build failure means the configuration is
//! broken, which receiver testing reports as an immediate failure
//! without touching the network.

use thiserror::Error;

use crate::engine::TestAlert;
use crate::routing::IntegrationConfig;

/// Errors constructing an integration from its configuration.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("unknown integration kind '{0}'")]
    UnknownKind(String),

    #[error("integration '{kind}' is missing required setting '{field}'")]
    MissingSetting { kind: String, field: String },

    #[error("integration '{kind}' setting '{field}' is invalid: {reason}")]
    InvalidSetting {
        kind: String,
        field: String,
        reason: String,
    },
}

/// Delivery failures, classified so callers can distinguish a slow
/// downstream from a broken configuration.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery timed out")]
    Timeout,

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// A single delivery integration.
#[async_trait::async_trait]
pub trait Integration: Send + Sync {
    /// The integration kind, e.g. "webhook".
    fn kind(&self) -> &str;

    /// Delivers one alert through the real delivery path.
    async fn notify(&self, alert: &TestAlert) -> Result<(), NotifyError>;
}

/// Builds integrations from their configuration.
pub trait IntegrationFactory: Send + Sync {
    fn build(&self, config: &IntegrationConfig) -> Result<Box<dyn Integration>, IntegrationError>;
}
