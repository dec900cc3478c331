//! herald-cluster: fleet membership and state replication.
//!
//! This crate keeps per-tenant engine state (silences, notification
//! log) synchronized across a horizontally replicated fleet. It
//! provides:
//!
//! - **Transport polymorphism**: the [`ClusterTransport`] capability
//!   set (`position`, `wait_ready`, `add_state`, `shutdown`) with
//!   three backends — SWIM-style gossip over UDP, a key/value store
//!   with TTL'd liveness keys and pub/sub broadcast, and a
//!   single-node no-op.
//! - **Replicated channels**: per-state-key broadcast conduits with a
//!   bounded outgoing queue and best-effort, fire-and-forget delivery.
//!   A lost broadcast is closed by the out-of-band full-state resync,
//!   never by backpressure on the caller.
//!
//! Replication carries no cross-peer ordering guarantee; consumers
//! must tolerate out-of-order and duplicate application.

mod channel;
mod error;
mod gossip;
mod keystore;
mod membership;
mod memory;
mod message;
mod transport;

pub use channel::{ReplicatedChannel, StatePublisher, OUTGOING_QUEUE_LEN};
pub use error::ClusterError;
pub use gossip::{GossipConfig, GossipTransport};
pub use keystore::{KeyStore, KeyStoreConfig, KeyStoreTransport};
pub use membership::{MembershipConfig, MembershipEngine, MembershipEvent, PeerState, PeerStatus};
pub use memory::MemoryKeyStore;
pub use message::{ClusterMessage, PeerInfo, PeerUpdate};
pub use transport::{ClusterTransport, SingleNodeTransport, StateHandler};

use uuid::Uuid;

/// Unique identity of a node in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Generates a new random peer ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // short form for log readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}
