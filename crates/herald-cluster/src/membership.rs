//! SWIM-style membership engine for the gossip transport.
//!
//! Each protocol period a random peer is probed with Ping. A probe
//! that times out marks the peer Suspect; after the suspicion timeout
//! it is marked Dead. A suspected peer refutes by bumping its
//! incarnation number. Membership changes are piggybacked on Ping and
//! Ack messages for epidemic dissemination.
//!
//! The engine is purely synchronous: it consumes messages and clock
//! ticks and returns the datagrams to send, which keeps it trivially
//! testable. Socket I/O lives in the transport wrapper.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::prelude::IndexedRandom;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::message::{ClusterMessage, PeerInfo, PeerUpdate};
use crate::PeerId;

/// Maximum allowed incarnation value. Rejects updates beyond this so a
/// misbehaving peer can't send u64::MAX and permanently win every
/// freshness comparison.
const MAX_INCARNATION: u64 = u64::MAX / 2;

/// Configuration for the membership protocol.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// How often to run a protocol period (probe a random peer).
    pub protocol_period: Duration,
    /// How long to wait for a probe response before suspecting.
    pub probe_timeout: Duration,
    /// Multiplier for the suspicion timeout
    /// (protocol_period * suspicion_mult).
    pub suspicion_mult: u32,
    /// Maximum number of updates to piggyback per message.
    pub max_piggyback: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            protocol_period: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            suspicion_mult: 5,
            max_piggyback: 10,
        }
    }
}

/// Health status of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Alive,
    Suspect,
    Dead,
    Left,
}

/// State of one peer as tracked by the engine.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub incarnation: u64,
    pub status: PeerStatus,
    pub status_change: Instant,
}

/// Events emitted as membership changes.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    PeerJoined(PeerId, SocketAddr),
    PeerSuspected(PeerId),
    PeerFailed(PeerId),
    PeerLeft(PeerId),
    PeerRecovered(PeerId),
}

struct PendingProbe {
    target: PeerId,
    sent_at: Instant,
}

/// Tracks cluster membership and drives failure detection.
pub struct MembershipEngine {
    local_id: PeerId,
    local_addr: SocketAddr,
    incarnation: u64,
    config: MembershipConfig,
    peers: HashMap<PeerId, PeerState>,
    pending_updates: Vec<PeerUpdate>,
    pending_probes: HashMap<u64, PendingProbe>,
    next_seq: u64,
    event_tx: mpsc::UnboundedSender<MembershipEvent>,
}

impl MembershipEngine {
    pub fn new(
        local_id: PeerId,
        local_addr: SocketAddr,
        config: MembershipConfig,
        event_tx: mpsc::UnboundedSender<MembershipEvent>,
    ) -> Self {
        Self {
            local_id,
            local_addr,
            incarnation: 1,
            config,
            peers: HashMap::new(),
            pending_updates: Vec::new(),
            pending_probes: HashMap::new(),
            next_seq: 1,
            event_tx,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Number of peers currently considered alive (excluding self).
    pub fn alive_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.status == PeerStatus::Alive)
            .count()
    }

    /// Addresses of all currently alive peers, used by the transport
    /// to fan out state broadcasts.
    pub fn alive_addrs(&self) -> Vec<SocketAddr> {
        self.peers
            .values()
            .filter(|p| p.status == PeerStatus::Alive)
            .map(|p| p.addr)
            .collect()
    }

    /// This node's ordinal among currently visible alive peers,
    /// computed by sorting peer IDs. A best-effort hint only: two
    /// nodes may briefly disagree during churn, so it must never be
    /// used as a leader-election primitive.
    pub fn position(&self) -> usize {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.status == PeerStatus::Alive)
            .map(|p| p.id)
            .collect();
        ids.push(self.local_id);
        ids.sort();
        ids.iter().position(|id| *id == self.local_id).unwrap_or(0)
    }

    /// Adds a seed peer to bootstrap discovery. Seeds start at
    /// incarnation 0 so any real update about them wins.
    pub fn add_seed(&mut self, id: PeerId, addr: SocketAddr) {
        if id == self.local_id {
            return;
        }
        self.ensure_peer(id, addr);
    }

    /// Creates the Join message sent to seed nodes at startup.
    pub fn create_join_message(&self) -> ClusterMessage {
        ClusterMessage::Join {
            sender: self.local_id,
            addr: self.local_addr,
        }
    }

    /// Builds the graceful-leave announcements sent at shutdown: a
    /// final Ack carrying a Left update, addressed to every alive peer.
    pub fn create_leave_messages(&mut self) -> Vec<(SocketAddr, ClusterMessage)> {
        let update = PeerUpdate::Left {
            peer: self.local_id,
        };
        self.peers
            .values()
            .filter(|p| p.status == PeerStatus::Alive)
            .map(|p| {
                (
                    p.addr,
                    ClusterMessage::Ack {
                        seq: 0,
                        sender: self.local_id,
                        updates: vec![update.clone()],
                    },
                )
            })
            .collect()
    }

    /// Handles an incoming message and returns the replies to send.
    pub fn handle_message(
        &mut self,
        msg: ClusterMessage,
        from: SocketAddr,
    ) -> Vec<(SocketAddr, ClusterMessage)> {
        match msg {
            ClusterMessage::Ping {
                seq,
                sender,
                updates,
            } => {
                trace!("ping seq={seq} from {sender}");
                self.apply_updates(&updates);
                self.ensure_peer(sender, from);
                let updates = self.collect_updates();
                vec![(
                    from,
                    ClusterMessage::Ack {
                        seq,
                        sender: self.local_id,
                        updates,
                    },
                )]
            }

            ClusterMessage::Ack {
                seq,
                sender,
                updates,
            } => {
                trace!("ack seq={seq} from {sender}");
                self.apply_updates(&updates);
                self.ensure_peer(sender, from);
                // an ack is direct evidence the sender is up, so it
                // refutes suspicion even when the probe that prompted
                // it already expired
                self.mark_alive(sender);
                self.pending_probes.remove(&seq);
                vec![]
            }

            ClusterMessage::Join { sender, addr } => {
                debug!("peer {sender} joining from {addr}");
                self.ensure_peer(sender, addr);
                self.queue_update(PeerUpdate::Alive {
                    peer: sender,
                    addr,
                    incarnation: 1,
                });

                let mut peers: Vec<PeerInfo> = self
                    .peers
                    .values()
                    .filter(|p| p.status == PeerStatus::Alive)
                    .map(|p| PeerInfo {
                        id: p.id,
                        addr: p.addr,
                        incarnation: p.incarnation,
                    })
                    .collect();
                // include ourselves so the joiner learns the full view
                peers.push(PeerInfo {
                    id: self.local_id,
                    addr: self.local_addr,
                    incarnation: self.incarnation,
                });

                vec![(
                    from,
                    ClusterMessage::Welcome {
                        sender: self.local_id,
                        peers,
                    },
                )]
            }

            ClusterMessage::Welcome { sender, peers } => {
                debug!("welcome from {sender} with {} peers", peers.len());
                self.ensure_peer(sender, from);
                for peer in peers {
                    if peer.id == self.local_id {
                        continue;
                    }
                    self.ensure_peer(peer.id, peer.addr);
                    if let Some(state) = self.peers.get_mut(&peer.id) {
                        if peer.incarnation > state.incarnation {
                            state.incarnation = peer.incarnation;
                        }
                    }
                }
                vec![]
            }

            // state broadcasts are routed to handlers by the transport,
            // never to the membership engine
            ClusterMessage::State { .. } => vec![],
        }
    }

    /// Runs one protocol period: expire timed-out probes and
    /// suspicions, then probe one random peer.
    pub fn tick(&mut self) -> Vec<(SocketAddr, ClusterMessage)> {
        self.check_probe_timeouts();
        self.check_suspicion_timeouts();

        let candidates: Vec<(PeerId, SocketAddr)> = self
            .peers
            .values()
            .filter(|p| p.status == PeerStatus::Alive || p.status == PeerStatus::Suspect)
            .map(|p| (p.id, p.addr))
            .collect();

        let (target, addr) = match candidates.choose(&mut rand::rng()) {
            Some(pick) => *pick,
            None => return vec![],
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending_probes.insert(
            seq,
            PendingProbe {
                target,
                sent_at: Instant::now(),
            },
        );

        let updates = self.collect_updates();
        vec![(
            addr,
            ClusterMessage::Ping {
                seq,
                sender: self.local_id,
                updates,
            },
        )]
    }

    fn ensure_peer(&mut self, id: PeerId, addr: SocketAddr) {
        if id == self.local_id {
            return;
        }
        if !self.peers.contains_key(&id) {
            self.peers.insert(
                id,
                PeerState {
                    id,
                    addr,
                    incarnation: 0,
                    status: PeerStatus::Alive,
                    status_change: Instant::now(),
                },
            );
            self.emit(MembershipEvent::PeerJoined(id, addr));
        }
    }

    fn mark_alive(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            if peer.status == PeerStatus::Suspect {
                peer.status = PeerStatus::Alive;
                peer.status_change = Instant::now();
                self.emit(MembershipEvent::PeerRecovered(id));
            }
        }
    }

    fn apply_updates(&mut self, updates: &[PeerUpdate]) {
        for update in updates {
            match update {
                PeerUpdate::Alive {
                    peer,
                    addr,
                    incarnation,
                } => {
                    if *incarnation > MAX_INCARNATION {
                        warn!("rejecting alive update for {peer} with excessive incarnation");
                        continue;
                    }
                    if *peer == self.local_id {
                        continue;
                    }
                    match self.peers.get_mut(peer) {
                        Some(state) => {
                            if *incarnation > state.incarnation {
                                state.incarnation = *incarnation;
                                state.addr = *addr;
                                if state.status != PeerStatus::Alive {
                                    state.status = PeerStatus::Alive;
                                    state.status_change = Instant::now();
                                    self.emit(MembershipEvent::PeerRecovered(*peer));
                                }
                            }
                        }
                        None => {
                            self.peers.insert(
                                *peer,
                                PeerState {
                                    id: *peer,
                                    addr: *addr,
                                    incarnation: *incarnation,
                                    status: PeerStatus::Alive,
                                    status_change: Instant::now(),
                                },
                            );
                            self.emit(MembershipEvent::PeerJoined(*peer, *addr));
                        }
                    }
                }

                PeerUpdate::Suspect { peer, incarnation } => {
                    if *incarnation > MAX_INCARNATION {
                        continue;
                    }
                    if *peer == self.local_id {
                        // refute by bumping our incarnation
                        if *incarnation >= self.incarnation {
                            self.incarnation = incarnation.saturating_add(1);
                            self.queue_update(PeerUpdate::Alive {
                                peer: self.local_id,
                                addr: self.local_addr,
                                incarnation: self.incarnation,
                            });
                        }
                        continue;
                    }
                    if let Some(state) = self.peers.get_mut(peer) {
                        if *incarnation >= state.incarnation && state.status == PeerStatus::Alive {
                            state.status = PeerStatus::Suspect;
                            state.status_change = Instant::now();
                            self.emit(MembershipEvent::PeerSuspected(*peer));
                        }
                    }
                }

                PeerUpdate::Dead { peer, incarnation } => {
                    if *incarnation > MAX_INCARNATION {
                        continue;
                    }
                    if *peer == self.local_id {
                        self.incarnation = incarnation.saturating_add(1);
                        self.queue_update(PeerUpdate::Alive {
                            peer: self.local_id,
                            addr: self.local_addr,
                            incarnation: self.incarnation,
                        });
                        continue;
                    }
                    if let Some(state) = self.peers.get_mut(peer) {
                        if *incarnation >= state.incarnation && state.status != PeerStatus::Dead {
                            state.status = PeerStatus::Dead;
                            state.status_change = Instant::now();
                            self.emit(MembershipEvent::PeerFailed(*peer));
                        }
                    }
                }

                PeerUpdate::Left { peer } => {
                    if *peer == self.local_id {
                        continue;
                    }
                    if let Some(state) = self.peers.get_mut(peer) {
                        if state.status != PeerStatus::Left {
                            state.status = PeerStatus::Left;
                            state.status_change = Instant::now();
                            self.emit(MembershipEvent::PeerLeft(*peer));
                        }
                    }
                }
            }
        }
    }

    /// Probes that never got an Ack mark their target Suspect and
    /// queue a Suspect update for dissemination.
    fn check_probe_timeouts(&mut self) {
        let timeout = self.config.probe_timeout;
        let now = Instant::now();

        let expired: Vec<(u64, PeerId)> = self
            .pending_probes
            .iter()
            .filter(|(_, probe)| now.duration_since(probe.sent_at) > timeout)
            .map(|(seq, probe)| (*seq, probe.target))
            .collect();

        for (seq, target) in expired {
            self.pending_probes.remove(&seq);
            let incarnation = match self.peers.get(&target) {
                Some(p) if p.status == PeerStatus::Alive => p.incarnation,
                _ => continue,
            };
            if let Some(peer) = self.peers.get_mut(&target) {
                debug!("peer {target} failed probe, marking suspect");
                peer.status = PeerStatus::Suspect;
                peer.status_change = Instant::now();
            }
            self.emit(MembershipEvent::PeerSuspected(target));
            self.queue_update(PeerUpdate::Suspect {
                peer: target,
                incarnation,
            });
        }
    }

    fn check_suspicion_timeouts(&mut self) {
        let suspicion_timeout = self.config.protocol_period * self.config.suspicion_mult;
        let now = Instant::now();

        let expired: Vec<(PeerId, u64)> = self
            .peers
            .values()
            .filter(|p| {
                p.status == PeerStatus::Suspect
                    && now.duration_since(p.status_change) > suspicion_timeout
            })
            .map(|p| (p.id, p.incarnation))
            .collect();

        for (id, incarnation) in expired {
            if let Some(peer) = self.peers.get_mut(&id) {
                warn!("peer {id} confirmed dead after suspicion timeout");
                peer.status = PeerStatus::Dead;
                peer.status_change = Instant::now();
            }
            self.emit(MembershipEvent::PeerFailed(id));
            self.queue_update(PeerUpdate::Dead {
                peer: id,
                incarnation,
            });
        }
    }

    fn queue_update(&mut self, update: PeerUpdate) {
        self.pending_updates.push(update);
        // on overflow drop the oldest: peers re-gossip their state
        // every protocol period, so a dropped update is re-sent later
        if self.pending_updates.len() > self.config.max_piggyback * 2 {
            self.pending_updates.drain(0..self.config.max_piggyback);
        }
    }

    fn collect_updates(&mut self) -> Vec<PeerUpdate> {
        let count = self.pending_updates.len().min(self.config.max_piggyback);
        self.pending_updates.drain(0..count).collect()
    }

    fn emit(&self, event: MembershipEvent) {
        // receiver dropped only during shutdown
        if self.event_tx.send(event).is_err() {
            trace!("membership event channel closed, dropping event");
        }
    }
}
