//! Binary wire format for cluster messages.
//!
//! Shared by both transports: the gossip backend sends these over UDP
//! datagrams, the key-store backend wraps the `State` frame in its
//! pub/sub payloads. All multi-byte integers are little-endian. The
//! transport is schema-agnostic to `State.data` as long as sender and
//! receiver agree on the state key.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::PeerId;

/// Maximum number of piggybacked updates or peers per message.
/// Prevents allocation bombs from crafted messages.
const MAX_COLLECTION_COUNT: usize = 1024;

/// Maximum byte length of a state key.
pub(crate) const MAX_KEY_LEN: usize = 255;

/// Maximum byte length of a state payload.
const MAX_STATE_LEN: usize = 1 << 20;

const TAG_PING: u8 = 1;
const TAG_ACK: u8 = 2;
const TAG_JOIN: u8 = 3;
const TAG_WELCOME: u8 = 4;
const TAG_STATE: u8 = 5;

const UPDATE_ALIVE: u8 = 1;
const UPDATE_SUSPECT: u8 = 2;
const UPDATE_DEAD: u8 = 3;
const UPDATE_LEFT: u8 = 4;

// Safe read helpers that return io::Error instead of panicking on
// truncated input.

fn eof(need: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("need {need}"))
}

fn safe_get_u8(buf: &mut &[u8]) -> io::Result<u8> {
    if buf.is_empty() {
        return Err(eof("1 byte"));
    }
    Ok(buf.get_u8())
}

fn safe_get_u16_le(buf: &mut &[u8]) -> io::Result<u16> {
    if buf.len() < 2 {
        return Err(eof("2 bytes"));
    }
    Ok(buf.get_u16_le())
}

fn safe_get_u32_le(buf: &mut &[u8]) -> io::Result<u32> {
    if buf.len() < 4 {
        return Err(eof("4 bytes"));
    }
    Ok(buf.get_u32_le())
}

fn safe_get_u64_le(buf: &mut &[u8]) -> io::Result<u64> {
    if buf.len() < 8 {
        return Err(eof("8 bytes"));
    }
    Ok(buf.get_u64_le())
}

fn safe_copy(buf: &mut &[u8], len: usize) -> io::Result<Vec<u8>> {
    if buf.len() < len {
        return Err(eof("payload bytes"));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn put_peer_id(buf: &mut BytesMut, id: PeerId) {
    buf.put_slice(id.0.as_bytes());
}

fn get_peer_id(buf: &mut &[u8]) -> io::Result<PeerId> {
    let raw = safe_copy(buf, 16)?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&raw);
    Ok(PeerId(Uuid::from_bytes(bytes)))
}

fn put_addr(buf: &mut BytesMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16_le(addr.port());
}

fn get_addr(buf: &mut &[u8]) -> io::Result<SocketAddr> {
    let family = safe_get_u8(buf)?;
    let ip = match family {
        4 => {
            let raw = safe_copy(buf, 4)?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&raw);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            let raw = safe_copy(buf, 16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address family {other}"),
            ))
        }
    };
    let port = safe_get_u16_le(buf)?;
    Ok(SocketAddr::new(ip, port))
}

/// Summary of a known peer, carried in Welcome replies so a joining
/// node learns the current membership in one round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub incarnation: u64,
}

/// A membership state change piggybacked on protocol messages.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerUpdate {
    Alive {
        peer: PeerId,
        addr: SocketAddr,
        incarnation: u64,
    },
    Suspect {
        peer: PeerId,
        incarnation: u64,
    },
    Dead {
        peer: PeerId,
        incarnation: u64,
    },
    Left {
        peer: PeerId,
    },
}

/// Messages exchanged between cluster peers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterMessage {
    /// Direct probe to check whether a peer is alive.
    Ping {
        seq: u64,
        sender: PeerId,
        updates: Vec<PeerUpdate>,
    },

    /// Response to a Ping.
    Ack {
        seq: u64,
        sender: PeerId,
        updates: Vec<PeerUpdate>,
    },

    /// Announce ourselves to a seed node.
    Join { sender: PeerId, addr: SocketAddr },

    /// Membership snapshot sent in response to a Join.
    Welcome {
        sender: PeerId,
        peers: Vec<PeerInfo>,
    },

    /// A replicated state broadcast: opaque engine state scoped to
    /// `key` (e.g. "7/silences"). Best-effort, unordered.
    State {
        sender: PeerId,
        key: String,
        data: Bytes,
    },
}

impl ClusterMessage {
    /// Encodes the message into its binary wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            ClusterMessage::Ping {
                seq,
                sender,
                updates,
            } => {
                buf.put_u8(TAG_PING);
                buf.put_u64_le(*seq);
                put_peer_id(&mut buf, *sender);
                put_updates(&mut buf, updates);
            }
            ClusterMessage::Ack {
                seq,
                sender,
                updates,
            } => {
                buf.put_u8(TAG_ACK);
                buf.put_u64_le(*seq);
                put_peer_id(&mut buf, *sender);
                put_updates(&mut buf, updates);
            }
            ClusterMessage::Join { sender, addr } => {
                buf.put_u8(TAG_JOIN);
                put_peer_id(&mut buf, *sender);
                put_addr(&mut buf, *addr);
            }
            ClusterMessage::Welcome { sender, peers } => {
                buf.put_u8(TAG_WELCOME);
                put_peer_id(&mut buf, *sender);
                buf.put_u16_le(peers.len() as u16);
                for peer in peers {
                    put_peer_id(&mut buf, peer.id);
                    put_addr(&mut buf, peer.addr);
                    buf.put_u64_le(peer.incarnation);
                }
            }
            ClusterMessage::State { sender, key, data } => {
                // the limit is enforced when the channel is registered;
                // a truncated key would be rejected by every decoder
                assert!(
                    key.len() <= MAX_KEY_LEN,
                    "state key '{key}' exceeds {MAX_KEY_LEN} bytes"
                );
                buf.put_u8(TAG_STATE);
                put_peer_id(&mut buf, *sender);
                buf.put_u8(key.len() as u8);
                buf.put_slice(key.as_bytes());
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }

    /// Decodes a message from its binary wire form.
    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        let tag = safe_get_u8(&mut buf)?;
        match tag {
            TAG_PING | TAG_ACK => {
                let seq = safe_get_u64_le(&mut buf)?;
                let sender = get_peer_id(&mut buf)?;
                let updates = get_updates(&mut buf)?;
                if tag == TAG_PING {
                    Ok(ClusterMessage::Ping {
                        seq,
                        sender,
                        updates,
                    })
                } else {
                    Ok(ClusterMessage::Ack {
                        seq,
                        sender,
                        updates,
                    })
                }
            }
            TAG_JOIN => {
                let sender = get_peer_id(&mut buf)?;
                let addr = get_addr(&mut buf)?;
                Ok(ClusterMessage::Join { sender, addr })
            }
            TAG_WELCOME => {
                let sender = get_peer_id(&mut buf)?;
                let count = safe_get_u16_le(&mut buf)? as usize;
                if count > MAX_COLLECTION_COUNT {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("welcome peer count {count} exceeds limit"),
                    ));
                }
                let mut peers = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = get_peer_id(&mut buf)?;
                    let addr = get_addr(&mut buf)?;
                    let incarnation = safe_get_u64_le(&mut buf)?;
                    peers.push(PeerInfo {
                        id,
                        addr,
                        incarnation,
                    });
                }
                Ok(ClusterMessage::Welcome { sender, peers })
            }
            TAG_STATE => {
                let sender = get_peer_id(&mut buf)?;
                let key_len = safe_get_u8(&mut buf)? as usize;
                let key_raw = safe_copy(&mut buf, key_len)?;
                let key = String::from_utf8(key_raw).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "state key is not utf-8")
                })?;
                let data_len = safe_get_u32_le(&mut buf)? as usize;
                if data_len > MAX_STATE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("state payload {data_len} exceeds limit"),
                    ));
                }
                let data = Bytes::from(safe_copy(&mut buf, data_len)?);
                Ok(ClusterMessage::State { sender, key, data })
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message tag {other}"),
            )),
        }
    }
}

fn put_updates(buf: &mut BytesMut, updates: &[PeerUpdate]) {
    buf.put_u16_le(updates.len() as u16);
    for update in updates {
        match update {
            PeerUpdate::Alive {
                peer,
                addr,
                incarnation,
            } => {
                buf.put_u8(UPDATE_ALIVE);
                put_peer_id(buf, *peer);
                put_addr(buf, *addr);
                buf.put_u64_le(*incarnation);
            }
            PeerUpdate::Suspect { peer, incarnation } => {
                buf.put_u8(UPDATE_SUSPECT);
                put_peer_id(buf, *peer);
                buf.put_u64_le(*incarnation);
            }
            PeerUpdate::Dead { peer, incarnation } => {
                buf.put_u8(UPDATE_DEAD);
                put_peer_id(buf, *peer);
                buf.put_u64_le(*incarnation);
            }
            PeerUpdate::Left { peer } => {
                buf.put_u8(UPDATE_LEFT);
                put_peer_id(buf, *peer);
            }
        }
    }
}

fn get_updates(buf: &mut &[u8]) -> io::Result<Vec<PeerUpdate>> {
    let count = safe_get_u16_le(buf)? as usize;
    if count > MAX_COLLECTION_COUNT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("update count {count} exceeds limit"),
        ));
    }
    let mut updates = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = safe_get_u8(buf)?;
        let update = match tag {
            UPDATE_ALIVE => {
                let peer = get_peer_id(buf)?;
                let addr = get_addr(buf)?;
                let incarnation = safe_get_u64_le(buf)?;
                PeerUpdate::Alive {
                    peer,
                    addr,
                    incarnation,
                }
            }
            UPDATE_SUSPECT => {
                let peer = get_peer_id(buf)?;
                let incarnation = safe_get_u64_le(buf)?;
                PeerUpdate::Suspect { peer, incarnation }
            }
            UPDATE_DEAD => {
                let peer = get_peer_id(buf)?;
                let incarnation = safe_get_u64_le(buf)?;
                PeerUpdate::Dead { peer, incarnation }
            }
            UPDATE_LEFT => {
                let peer = get_peer_id(buf)?;
                PeerUpdate::Left { peer }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown update tag {other}"),
                ))
            }
        };
        updates.push(update);
    }
    Ok(updates)
}
