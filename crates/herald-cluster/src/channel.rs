//! Per-state-key broadcast conduit.
//!
//! Broadcast is fire-and-forget by construction: the caller enqueues
//! onto a bounded queue serviced by one dedicated publishing task, and
//! a full queue drops the message and bumps a counter instead of
//! applying backpressure. The out-of-band full-state resync is
//! responsible for closing any gap a dropped or failed publish leaves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ClusterError;

/// Outgoing queue length per channel, sized like the gossip backend's
/// default broadcast queue.
pub const OUTGOING_QUEUE_LEN: usize = 200;

/// Publishes one encoded state broadcast to the fleet. Implemented by
/// each transport backend.
#[async_trait::async_trait]
pub trait StatePublisher: Send + Sync {
    async fn publish(&self, key: &str, data: Bytes) -> Result<(), ClusterError>;
}

/// A named, bounded, best-effort broadcast conduit for one kind of
/// replicated engine state.
pub struct ReplicatedChannel {
    key: Arc<str>,
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for ReplicatedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedChannel")
            .field("key", &self.key)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl ReplicatedChannel {
    /// Creates the channel and spawns its dedicated publishing task.
    /// The task exits when the channel is dropped.
    ///
    /// Panics if the key exceeds the wire format's length limit, so a
    /// bad key fails at registration rather than corrupting frames.
    pub fn new(key: &str, publisher: Arc<dyn StatePublisher>) -> Self {
        assert!(
            key.len() <= crate::message::MAX_KEY_LEN,
            "state key '{key}' exceeds {} bytes",
            crate::message::MAX_KEY_LEN
        );
        let (tx, mut rx) = mpsc::channel::<Bytes>(OUTGOING_QUEUE_LEN);
        let key: Arc<str> = Arc::from(key);

        let task_key = Arc::clone(&key);
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = publisher.publish(&task_key, data).await {
                    // transport failures never fail the caller; the
                    // full resync is the consistency backstop
                    warn!(key = %task_key, "state publish failed: {e}");
                    counter!("herald_cluster_publish_failures_total", "key" => task_key.to_string())
                        .increment(1);
                }
            }
            debug!(key = %task_key, "replicated channel closed");
        });

        Self {
            key,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The state key this channel replicates.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Enqueues a state broadcast. Never blocks: when the queue is
    /// full the message is dropped and the overflow counter is
    /// incremented exactly once. Returns whether the message was
    /// accepted.
    pub fn broadcast(&self, data: Bytes) -> bool {
        match self.tx.try_send(data) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(key = %self.key, "outgoing state queue full, dropping broadcast");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("herald_cluster_messages_dropped_total", "key" => self.key.to_string())
                    .increment(1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(key = %self.key, "broadcast after channel shutdown");
                false
            }
        }
    }

    /// Total broadcasts dropped due to a full queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
