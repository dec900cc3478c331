//! Error types for the engine contract.

use thiserror::Error;

use crate::routing::ValidationError;

/// Errors returned by dispatch-engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine has no applied configuration yet.
    #[error("engine has no applied configuration")]
    NoConfig,

    /// The supplied configuration failed structural validation.
    #[error(transparent)]
    InvalidConfig(#[from] ValidationError),

    /// A replicated state blob could not be merged.
    #[error("failed to merge state '{key}': {reason}")]
    Merge { key: String, reason: String },

    /// The engine has been stopped.
    #[error("engine is stopped")]
    Stopped,
}
