//! Gossip-backed cluster transport.
//!
//! A thin wrapper over the membership engine: binds a UDP socket,
//! drives protocol ticks, routes incoming datagrams, and fans state
//! broadcasts out to every currently alive peer. Ordinal and quorum
//! semantics come from the membership engine unchanged.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ReplicatedChannel, StatePublisher};
use crate::error::ClusterError;
use crate::membership::{MembershipConfig, MembershipEngine, MembershipEvent};
use crate::message::ClusterMessage;
use crate::transport::{ClusterTransport, StateHandler};
use crate::PeerId;

/// Largest datagram we accept. State payloads beyond this must go
/// through the key-store backend instead.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Configuration for the gossip transport.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// UDP address to bind the gossip bus on.
    pub bind_addr: SocketAddr,
    /// Seed peers to announce ourselves to at startup.
    pub seeds: Vec<SocketAddr>,
    /// Minimum count of visible peers (including self) before
    /// `wait_ready` resolves.
    pub quorum: usize,
    /// Sleep between `wait_ready` polls.
    pub ready_poll_interval: Duration,
    /// Membership protocol tuning.
    pub membership: MembershipConfig,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9094)),
            seeds: Vec::new(),
            quorum: 1,
            ready_poll_interval: Duration::from_millis(250),
            membership: MembershipConfig::default(),
        }
    }
}

/// Cluster transport delegating membership to the gossip engine.
pub struct GossipTransport {
    local_id: PeerId,
    engine: Arc<Mutex<MembershipEngine>>,
    socket: Arc<UdpSocket>,
    handlers: Arc<DashMap<String, Arc<dyn StateHandler>>>,
    /// Alive-peer count cached by the tick task so `position` and
    /// `wait_ready` never contend on the engine lock.
    alive_peers: Arc<AtomicUsize>,
    position: Arc<AtomicUsize>,
    quorum: usize,
    ready_poll_interval: Duration,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for GossipTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipTransport")
            .field("local_id", &self.local_id)
            .field("quorum", &self.quorum)
            .finish_non_exhaustive()
    }
}

impl GossipTransport {
    /// Binds the gossip socket, announces to the seeds, and spawns the
    /// receive, tick, and event tasks.
    pub async fn spawn(config: GossipConfig) -> Result<Arc<Self>, ClusterError> {
        if config.quorum == 0 {
            return Err(ClusterError::Configuration("quorum must be at least 1".into()));
        }
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|e| ClusterError::Configuration(format!("gossip bind failed: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ClusterError::Configuration(e.to_string()))?;
        let socket = Arc::new(socket);

        let local_id = PeerId::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Mutex::new(MembershipEngine::new(
            local_id,
            local_addr,
            config.membership.clone(),
            event_tx,
        )));

        info!("gossip transport {local_id} listening on {local_addr}");

        let transport = Arc::new(Self {
            local_id,
            engine,
            socket,
            handlers: Arc::new(DashMap::new()),
            alive_peers: Arc::new(AtomicUsize::new(0)),
            position: Arc::new(AtomicUsize::new(0)),
            quorum: config.quorum,
            ready_poll_interval: config.ready_poll_interval,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        // announce ourselves to the seeds
        {
            let join = {
                let engine = transport.engine.lock().await;
                engine.create_join_message().encode()
            };
            for seed in &config.seeds {
                if let Err(e) = transport.socket.send_to(&join, seed).await {
                    warn!("failed to send join to seed {seed}: {e}");
                }
            }
        }

        let recv_task = tokio::spawn(Self::recv_loop(Arc::clone(&transport)));
        let tick_task = tokio::spawn(Self::tick_loop(
            Arc::clone(&transport),
            config.membership.protocol_period,
        ));
        let event_task = tokio::spawn(Self::event_loop(event_rx));

        if let Ok(mut tasks) = transport.tasks.lock() {
            tasks.extend([recv_task, tick_task, event_task]);
        }

        Ok(transport)
    }

    async fn recv_loop(transport: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match transport.socket.recv_from(&mut buf).await {
                Ok(recv) => recv,
                Err(e) => {
                    warn!("gossip socket receive error: {e}");
                    continue;
                }
            };
            let msg = match ClusterMessage::decode(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("dropping malformed datagram from {from}: {e}");
                    counter!("herald_cluster_decode_failures_total").increment(1);
                    continue;
                }
            };

            match msg {
                ClusterMessage::State { sender, key, data } => {
                    if sender == transport.local_id {
                        continue;
                    }
                    transport.dispatch_state(&key, data);
                }
                other => {
                    let replies = {
                        let mut engine = transport.engine.lock().await;
                        engine.handle_message(other, from)
                    };
                    transport.send_all(&replies).await;
                    transport.refresh_view().await;
                }
            }
        }
    }

    async fn tick_loop(transport: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let outgoing = {
                let mut engine = transport.engine.lock().await;
                engine.tick()
            };
            transport.send_all(&outgoing).await;
            transport.refresh_view().await;
        }
    }

    async fn event_loop(mut event_rx: mpsc::UnboundedReceiver<MembershipEvent>) {
        while let Some(event) = event_rx.recv().await {
            match event {
                MembershipEvent::PeerJoined(id, addr) => info!("peer {id} joined from {addr}"),
                MembershipEvent::PeerSuspected(id) => debug!("peer {id} suspected"),
                MembershipEvent::PeerFailed(id) => warn!("peer {id} failed"),
                MembershipEvent::PeerLeft(id) => info!("peer {id} left"),
                MembershipEvent::PeerRecovered(id) => info!("peer {id} recovered"),
            }
        }
    }

    fn dispatch_state(&self, key: &str, data: Bytes) {
        match self.handlers.get(key) {
            Some(handler) => {
                if let Err(e) = handler.merge(data) {
                    warn!(key, "state merge failed: {e}");
                    counter!("herald_cluster_merge_failures_total", "key" => key.to_string())
                        .increment(1);
                }
            }
            None => debug!(key, "no handler registered for state broadcast"),
        }
    }

    async fn send_all(&self, messages: &[(SocketAddr, ClusterMessage)]) {
        for (addr, msg) in messages {
            if let Err(e) = self.socket.send_to(&msg.encode(), addr).await {
                debug!("gossip send to {addr} failed: {e}");
            }
        }
    }

    /// Updates the cached alive count and position from the engine.
    async fn refresh_view(&self) {
        let (alive, position) = {
            let engine = self.engine.lock().await;
            (engine.alive_count(), engine.position())
        };
        self.alive_peers.store(alive, Ordering::Relaxed);
        self.position.store(position, Ordering::Relaxed);
        gauge!("herald_cluster_peers").set((alive + 1) as f64);
    }
}

struct GossipPublisher {
    local_id: PeerId,
    socket: Arc<UdpSocket>,
    engine: Arc<Mutex<MembershipEngine>>,
}

#[async_trait::async_trait]
impl StatePublisher for GossipPublisher {
    async fn publish(&self, key: &str, data: Bytes) -> Result<(), ClusterError> {
        let addrs = {
            let engine = self.engine.lock().await;
            engine.alive_addrs()
        };
        if addrs.is_empty() {
            return Ok(());
        }
        let encoded = ClusterMessage::State {
            sender: self.local_id,
            key: key.to_string(),
            data,
        }
        .encode();

        let mut failed = 0usize;
        for addr in &addrs {
            if self.socket.send_to(&encoded, addr).await.is_err() {
                failed += 1;
            }
        }
        if failed == addrs.len() {
            return Err(ClusterError::Publish(format!(
                "all {failed} peer sends failed for '{key}'"
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterTransport for GossipTransport {
    fn position(&self) -> usize {
        self.position.load(Ordering::Relaxed)
    }

    async fn wait_ready(&self) {
        loop {
            if self.alive_peers.load(Ordering::Relaxed) + 1 >= self.quorum {
                return;
            }
            tokio::time::sleep(self.ready_poll_interval).await;
        }
    }

    fn add_state(&self, key: &str, handler: Arc<dyn StateHandler>) -> ReplicatedChannel {
        self.handlers.insert(key.to_string(), handler);
        ReplicatedChannel::new(
            key,
            Arc::new(GossipPublisher {
                local_id: self.local_id,
                socket: Arc::clone(&self.socket),
                engine: Arc::clone(&self.engine),
            }),
        )
    }

    async fn shutdown(&self) {
        let leaves = {
            let mut engine = self.engine.lock().await;
            engine.create_leave_messages()
        };
        self.send_all(&leaves).await;
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("gossip transport {} left the cluster", self.local_id);
    }
}
