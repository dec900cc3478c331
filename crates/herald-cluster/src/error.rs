//! Error types for cluster operations.

use thiserror::Error;

/// Errors that can occur during cluster operations.
///
/// Transport-level publish and liveness errors are logged and counted
/// by the replication layer, never propagated as fatal — the
/// out-of-band full resync is the consistency backstop.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A wire message could not be decoded.
    #[error("malformed cluster message: {0}")]
    Decode(#[from] std::io::Error),

    /// The underlying transport failed to publish a broadcast.
    #[error("publish failed: {0}")]
    Publish(String),

    /// A key/value store operation failed.
    #[error("key store error: {0}")]
    Store(String),

    /// A state handler rejected a merge.
    #[error("merge rejected for '{key}': {reason}")]
    Merge { key: String, reason: String },

    /// Invalid transport configuration.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),
}
