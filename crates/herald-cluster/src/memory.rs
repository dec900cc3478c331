//! In-memory key/pub-sub store.
//!
//! Backs tests and single-process deployments of the key-store
//! transport. Entries expire against a monotonic clock and are reaped
//! lazily on access; pub/sub fans out through broadcast channels with
//! a bounded buffer per subscriber.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::error::ClusterError;
use crate::keystore::KeyStore;

/// Buffered messages per subscriber before a slow consumer starts
/// missing broadcasts. Missed broadcasts are acceptable here: the
/// full-state resync closes the gap.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    #[allow(dead_code)] // liveness keys carry empty values today
    value: Bytes,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// A process-local [`KeyStore`].
pub struct MemoryKeyStore {
    entries: DashMap<String, Entry>,
    channels: DashMap<String, broadcast::Sender<Bytes>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            channels: DashMap::new(),
        }
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyStore")
            .field("keys", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl KeyStore for MemoryKeyStore {
    async fn put_with_ttl(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), ClusterError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ClusterError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, ClusterError> {
        // reap expired entries while scanning
        self.entries.retain(|_, entry| !entry.is_expired());
        Ok(self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, ClusterError> {
        match self.channels.get(channel) {
            Some(tx) => Ok(tx.send(payload).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, ClusterError> {
        let mut rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .subscribe();

        // bridge the broadcast receiver onto the trait's mpsc shape
        let (tx, out) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("subscriber lagged, missed {missed} broadcasts");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }
}
