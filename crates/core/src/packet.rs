//! Opaque packet model shared by every stage of the proxy pipeline.
//!
//! A packet is an uninterpreted payload plus the routing metadata the
//! transport needs. Field semantics of the game protocol are never parsed
//! here; the leading packet-id varint is captured as a tag for routing only.

use serde::{Deserialize, Serialize};

/// Identifier for one proxied client connection.
///
/// Assigned by the external proxy when a game client connects and carried
/// across the link so the internal proxy can mirror the connection to the
/// origin server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Direction a packet travels through the proxy pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// From the origin server towards a game client.
    Clientbound,
    /// From a game client towards the origin server.
    Serverbound,
}

impl Direction {
    /// The opposite direction.
    pub fn reverse(self) -> Self {
        match self {
            Direction::Clientbound => Direction::Serverbound,
            Direction::Serverbound => Direction::Clientbound,
        }
    }
}

/// Leading packet-id varint of a game packet, kept for routing decisions
/// (chunk detection, dimension tracking). Opaque beyond that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketTag(pub i32);

/// One game packet: routing metadata around an opaque payload.
///
/// The payload includes the packet-id varint, so writing it back out
/// reproduces the original frame body byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Connection the packet belongs to.
    pub conn: ConnectionId,
    /// Direction of travel.
    pub direction: Direction,
    /// Leading packet-id varint.
    pub tag: PacketTag,
    /// Raw frame body, id varint included.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Construct a packet from its parts.
    pub fn new(conn: ConnectionId, direction: Direction, tag: PacketTag, payload: Vec<u8>) -> Self {
        Self {
            conn,
            direction,
            tag,
            payload,
        }
    }

    /// Raw payload size in bytes, used for flush-threshold accounting.
    pub fn raw_len(&self) -> usize {
        self.payload.len()
    }
}
