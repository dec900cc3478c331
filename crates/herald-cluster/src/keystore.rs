//! Key-store cluster transport.
//!
//! Liveness and broadcast over a Redis-style key/pub-sub store:
//!
//! - each node advertises liveness via a TTL'd `peer-<uuid>` key,
//!   refreshed at roughly half the TTL;
//! - `position()` lexicographically sorts the currently live liveness
//!   keys and finds this node's index;
//! - `wait_ready` polls the live-key count against the quorum
//!   threshold with bounded sleeps;
//! - broadcasts ride one shared pub/sub channel carrying the binary
//!   `{key, data}` state envelope.
//!
//! The store engine itself is external; this module only needs the
//! [`KeyStore`] capability set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ReplicatedChannel, StatePublisher};
use crate::error::ClusterError;
use crate::message::ClusterMessage;
use crate::transport::{ClusterTransport, StateHandler};
use crate::PeerId;

/// Liveness key prefix; membership size is inferred by counting live
/// keys matching it.
const LIVENESS_PREFIX: &str = "peer-";

/// Minimal capability set needed from the external key/pub-sub store.
#[async_trait::async_trait]
pub trait KeyStore: Send + Sync {
    /// Writes `key` with a time-to-live. Overwrites and refreshes the
    /// TTL if the key exists.
    async fn put_with_ttl(&self, key: &str, value: Bytes, ttl: Duration)
        -> Result<(), ClusterError>;

    /// Removes a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), ClusterError>;

    /// Returns all currently live keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, ClusterError>;

    /// Publishes a payload to a pub/sub channel. Returns the number of
    /// subscribers that received it.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, ClusterError>;

    /// Subscribes to a pub/sub channel.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, ClusterError>;
}

/// Configuration for the key-store transport.
#[derive(Debug, Clone)]
pub struct KeyStoreConfig {
    /// TTL on the liveness key. The refresh task runs at half this.
    pub liveness_ttl: Duration,
    /// Minimum count of live peers (including self) before
    /// `wait_ready` resolves.
    pub quorum: usize,
    /// Sleep between `wait_ready` polls.
    pub ready_poll_interval: Duration,
    /// Pub/sub channel all state broadcasts ride on.
    pub broadcast_channel: String,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            liveness_ttl: Duration::from_secs(10),
            quorum: 1,
            ready_poll_interval: Duration::from_millis(250),
            broadcast_channel: "herald-state".to_string(),
        }
    }
}

/// Cluster transport over an external key/pub-sub store.
pub struct KeyStoreTransport {
    local_id: PeerId,
    liveness_key: String,
    store: Arc<dyn KeyStore>,
    config: KeyStoreConfig,
    handlers: Arc<DashMap<String, Arc<dyn StateHandler>>>,
    /// Live liveness keys cached by the heartbeat task, sorted.
    live_keys: Arc<RwLock<Vec<String>>>,
    live_count: Arc<AtomicUsize>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for KeyStoreTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStoreTransport")
            .field("local_id", &self.local_id)
            .field("quorum", &self.config.quorum)
            .finish_non_exhaustive()
    }
}

impl KeyStoreTransport {
    /// Registers this node in the store and spawns the heartbeat and
    /// subscription tasks.
    pub async fn spawn(
        store: Arc<dyn KeyStore>,
        config: KeyStoreConfig,
    ) -> Result<Arc<Self>, ClusterError> {
        if config.quorum == 0 {
            return Err(ClusterError::Configuration("quorum must be at least 1".into()));
        }
        let local_id = PeerId::new();
        let liveness_key = format!("{LIVENESS_PREFIX}{}", local_id.0);

        store
            .put_with_ttl(&liveness_key, Bytes::new(), config.liveness_ttl)
            .await?;
        let subscription = store.subscribe(&config.broadcast_channel).await?;

        info!("key-store transport registered as {liveness_key}");

        let transport = Arc::new(Self {
            local_id,
            liveness_key,
            store,
            config,
            handlers: Arc::new(DashMap::new()),
            live_keys: Arc::new(RwLock::new(Vec::new())),
            live_count: Arc::new(AtomicUsize::new(1)),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        transport.refresh_liveness().await;

        let heartbeat = tokio::spawn(Self::heartbeat_loop(Arc::clone(&transport)));
        let subscriber = tokio::spawn(Self::subscribe_loop(Arc::clone(&transport), subscription));
        if let Ok(mut tasks) = transport.tasks.lock() {
            tasks.extend([heartbeat, subscriber]);
        }

        Ok(transport)
    }

    /// Refreshes our liveness key and re-reads the live-key set.
    async fn heartbeat_loop(transport: Arc<Self>) {
        let mut interval = tokio::time::interval(transport.config.liveness_ttl / 2);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // first tick fires immediately; we already registered
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = transport
                .store
                .put_with_ttl(
                    &transport.liveness_key,
                    Bytes::new(),
                    transport.config.liveness_ttl,
                )
                .await
            {
                warn!("liveness refresh failed: {e}");
                counter!("herald_cluster_liveness_failures_total").increment(1);
            }
            transport.refresh_liveness().await;
        }
    }

    async fn subscribe_loop(transport: Arc<Self>, mut rx: mpsc::Receiver<Bytes>) {
        while let Some(payload) = rx.recv().await {
            let msg = match ClusterMessage::decode(&payload) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("dropping malformed broadcast: {e}");
                    counter!("herald_cluster_decode_failures_total").increment(1);
                    continue;
                }
            };
            let ClusterMessage::State { sender, key, data } = msg else {
                debug!("unexpected non-state message on broadcast channel");
                continue;
            };
            if sender == transport.local_id {
                continue;
            }
            match transport.handlers.get(&key) {
                Some(handler) => {
                    if let Err(e) = handler.merge(data) {
                        warn!(key, "state merge failed: {e}");
                        counter!("herald_cluster_merge_failures_total", "key" => key.clone())
                            .increment(1);
                    }
                }
                None => debug!(key, "no handler registered for state broadcast"),
            }
        }
        debug!("broadcast subscription closed");
    }

    /// Scans the liveness keys and updates the cached membership view.
    async fn refresh_liveness(&self) {
        match self.store.scan(LIVENESS_PREFIX).await {
            Ok(mut keys) => {
                keys.sort();
                self.live_count.store(keys.len(), Ordering::Relaxed);
                gauge!("herald_cluster_peers").set(keys.len() as f64);
                if let Ok(mut cached) = self.live_keys.write() {
                    *cached = keys;
                }
            }
            Err(e) => {
                warn!("liveness scan failed: {e}");
                counter!("herald_cluster_liveness_failures_total").increment(1);
            }
        }
    }
}

struct KeyStorePublisher {
    local_id: PeerId,
    store: Arc<dyn KeyStore>,
    channel: String,
}

#[async_trait::async_trait]
impl StatePublisher for KeyStorePublisher {
    async fn publish(&self, key: &str, data: Bytes) -> Result<(), ClusterError> {
        let encoded = ClusterMessage::State {
            sender: self.local_id,
            key: key.to_string(),
            data,
        }
        .encode();
        self.store.publish(&self.channel, encoded).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterTransport for KeyStoreTransport {
    /// Index of our liveness key in the lexicographically sorted set
    /// of live keys. Best-effort: a peer whose key just expired shifts
    /// everyone behind it, so this is a work-spreading hint only.
    fn position(&self) -> usize {
        self.live_keys
            .read()
            .ok()
            .and_then(|keys| keys.iter().position(|k| *k == self.liveness_key))
            .unwrap_or(0)
    }

    async fn wait_ready(&self) {
        loop {
            self.refresh_liveness().await;
            if self.live_count.load(Ordering::Relaxed) >= self.config.quorum {
                return;
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
    }

    fn add_state(&self, key: &str, handler: Arc<dyn StateHandler>) -> ReplicatedChannel {
        self.handlers.insert(key.to_string(), handler);
        ReplicatedChannel::new(
            key,
            Arc::new(KeyStorePublisher {
                local_id: self.local_id,
                store: Arc::clone(&self.store),
                channel: self.config.broadcast_channel.clone(),
            }),
        )
    }

    async fn shutdown(&self) {
        if let Err(e) = self.store.delete(&self.liveness_key).await {
            warn!("failed to delete liveness key at shutdown: {e}");
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("key-store transport {} left the cluster", self.local_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKeyStore;
    use std::sync::Mutex as StdMutex;

    struct CollectingHandler(StdMutex<Vec<Bytes>>);

    impl StateHandler for CollectingHandler {
        fn merge(&self, data: Bytes) -> Result<(), ClusterError> {
            if let Ok(mut seen) = self.0.lock() {
                seen.push(data);
            }
            Ok(())
        }
    }

    fn fast_config(quorum: usize) -> KeyStoreConfig {
        KeyStoreConfig {
            liveness_ttl: Duration::from_millis(200),
            quorum,
            ready_poll_interval: Duration::from_millis(10),
            ..KeyStoreConfig::default()
        }
    }

    #[tokio::test]
    async fn liveness_key_follows_convention() {
        let store = Arc::new(MemoryKeyStore::new());
        let transport = KeyStoreTransport::spawn(store.clone(), fast_config(1))
            .await
            .unwrap();

        let keys = store.scan(LIVENESS_PREFIX).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("peer-"));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn wait_ready_blocks_until_quorum() {
        let store = Arc::new(MemoryKeyStore::new());
        let a = KeyStoreTransport::spawn(store.clone(), fast_config(2))
            .await
            .unwrap();

        // quorum of 2 with one live key: must not be ready yet
        assert!(
            tokio::time::timeout(Duration::from_millis(100), a.wait_ready())
                .await
                .is_err()
        );

        let b = KeyStoreTransport::spawn(store.clone(), fast_config(2))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), a.wait_ready())
            .await
            .expect("second registration should satisfy quorum");

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn positions_are_distinct_after_refresh() {
        let store = Arc::new(MemoryKeyStore::new());
        let a = KeyStoreTransport::spawn(store.clone(), fast_config(2))
            .await
            .unwrap();
        let b = KeyStoreTransport::spawn(store.clone(), fast_config(2))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(a.wait_ready(), b.wait_ready())
        })
        .await
        .unwrap();

        let positions = [a.position(), b.position()];
        assert!(positions.contains(&0) && positions.contains(&1));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_peer_but_not_self() {
        let store = Arc::new(MemoryKeyStore::new());
        let a = KeyStoreTransport::spawn(store.clone(), fast_config(1))
            .await
            .unwrap();
        let b = KeyStoreTransport::spawn(store.clone(), fast_config(1))
            .await
            .unwrap();

        let a_handler = Arc::new(CollectingHandler(StdMutex::new(Vec::new())));
        let b_handler = Arc::new(CollectingHandler(StdMutex::new(Vec::new())));
        let a_channel = a.add_state("7/silences", Arc::clone(&a_handler) as Arc<_>);
        let _b_channel = b.add_state("7/silences", Arc::clone(&b_handler) as Arc<_>);

        assert!(a_channel.broadcast(Bytes::from_static(b"silence-1")));

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if b_handler.0.lock().map(|seen| !seen.is_empty()).unwrap_or(false) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer should receive the broadcast");

        // the sender never merges its own broadcast
        assert!(a_handler.0.lock().unwrap().is_empty());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn expired_peer_drops_out_of_membership() {
        let store = Arc::new(MemoryKeyStore::new());
        let a = KeyStoreTransport::spawn(store.clone(), fast_config(1))
            .await
            .unwrap();
        let b = KeyStoreTransport::spawn(store.clone(), fast_config(1))
            .await
            .unwrap();

        // stop b's heartbeat so its key expires
        b.shutdown().await;

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                a.refresh_liveness().await;
                if a.live_count.load(Ordering::Relaxed) == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("expired peer should disappear from the live set");

        a.shutdown().await;
    }
}
