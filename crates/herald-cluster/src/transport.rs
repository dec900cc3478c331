//! The cluster-transport capability set.

use std::sync::Arc;

use bytes::Bytes;

use crate::channel::{ReplicatedChannel, StatePublisher};
use crate::error::ClusterError;

/// Consumes incoming state broadcasts for one state key, merging them
/// into the local engine. Must tolerate duplicates and reordering.
pub trait StateHandler: Send + Sync {
    fn merge(&self, data: Bytes) -> Result<(), ClusterError>;
}

/// Capability set the orchestrator needs from a cluster backend.
///
/// Implementations are selected once at construction from explicit
/// configuration and dispatched through `Arc<dyn ClusterTransport>`.
#[async_trait::async_trait]
pub trait ClusterTransport: Send + Sync {
    /// This node's ordinal among currently visible peers. A
    /// best-effort hint for spreading periodic work, not a
    /// leader-election primitive: distinct nodes may briefly disagree
    /// during membership churn.
    fn position(&self) -> usize;

    /// Resolves once a quorum of peers is visible. Callers bound this
    /// with their own timeout and degrade gracefully when it elapses.
    async fn wait_ready(&self);

    /// Registers a handler for incoming broadcasts on `key` and
    /// returns the outgoing broadcast conduit for it.
    fn add_state(&self, key: &str, handler: Arc<dyn StateHandler>) -> ReplicatedChannel;

    /// Leaves cluster membership and stops background tasks.
    async fn shutdown(&self);
}

/// Transport for non-replicated deployments: always ready, position
/// zero, broadcasts discarded.
#[derive(Debug, Default)]
pub struct SingleNodeTransport;

struct DiscardPublisher;

#[async_trait::async_trait]
impl StatePublisher for DiscardPublisher {
    async fn publish(&self, _key: &str, _data: Bytes) -> Result<(), ClusterError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterTransport for SingleNodeTransport {
    fn position(&self) -> usize {
        0
    }

    async fn wait_ready(&self) {}

    fn add_state(&self, key: &str, _handler: Arc<dyn StateHandler>) -> ReplicatedChannel {
        ReplicatedChannel::new(key, Arc::new(DiscardPublisher))
    }

    async fn shutdown(&self) {}
}
