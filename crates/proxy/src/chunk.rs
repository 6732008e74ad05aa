//! Chunk packet recognition for the cache path.
//!
//! Only the fixed leading fields of a chunk packet are read: coordinates
//! and the full-chunk flag. Partial (delta) chunks are never cached; they
//! mutate an already-delivered column on the client. The world identifier
//! comes from a per-connection dimension tracker fed by the join/respawn
//! packets, the only game-state this proxy observes.

use crate::adapter::parse_varint;
use mclink_core::{ConnectionId, Packet};
use std::collections::HashMap;
use tracing::trace;

/// Leading fields of a chunk data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeaderInfo {
    /// Chunk x coordinate.
    pub x: i32,
    /// Chunk z coordinate.
    pub z: i32,
    /// True for a full column; only these are cache eligible.
    pub full: bool,
}

/// Parse the chunk packet header: `[id varint][x: i32][z: i32][full: bool]`,
/// ints big-endian per the game protocol.
pub fn parse_chunk_header(payload: &[u8]) -> Option<ChunkHeaderInfo> {
    let (_, id_len) = parse_varint(payload).ok()?;
    let rest = payload.get(id_len..)?;
    if rest.len() < 9 {
        return None;
    }
    let x = i32::from_be_bytes(rest[0..4].try_into().ok()?);
    let z = i32::from_be_bytes(rest[4..8].try_into().ok()?);
    let full = rest[8] != 0;
    Some(ChunkHeaderInfo { x, z, full })
}

/// Tracks each connection's current dimension from join/respawn packets.
pub struct DimensionTracker {
    join_game_tag: i32,
    respawn_tag: i32,
    dimensions: HashMap<ConnectionId, i32>,
}

impl DimensionTracker {
    /// Create a tracker for the configured packet tags.
    pub fn new(join_game_tag: i32, respawn_tag: i32) -> Self {
        Self {
            join_game_tag,
            respawn_tag,
            dimensions: HashMap::new(),
        }
    }

    /// Observe a clientbound packet, capturing dimension changes.
    ///
    /// Join game: `[id][entity_id: i32][gamemode: u8][dimension: i32]`.
    /// Respawn: `[id][dimension: i32]`.
    pub fn observe(&mut self, packet: &Packet) {
        let tag = packet.tag.0;
        if tag != self.join_game_tag && tag != self.respawn_tag {
            return;
        }
        let Ok((_, id_len)) = parse_varint(&packet.payload) else {
            return;
        };
        let rest = &packet.payload[id_len..];

        let dimension = if tag == self.join_game_tag {
            // Skip entity id and gamemode.
            rest.get(5..9)
                .and_then(|b| b.try_into().ok())
                .map(i32::from_be_bytes)
        } else {
            rest.get(0..4)
                .and_then(|b| b.try_into().ok())
                .map(i32::from_be_bytes)
        };

        if let Some(dimension) = dimension {
            trace!("{} is now in dimension {}", packet.conn, dimension);
            self.dimensions.insert(packet.conn, dimension);
        }
    }

    /// Current dimension for a connection (overworld when unknown).
    pub fn world_for(&self, conn: ConnectionId) -> i32 {
        self.dimensions.get(&conn).copied().unwrap_or(0)
    }

    /// Drop state for a closed connection.
    pub fn forget(&mut self, conn: ConnectionId) {
        self.dimensions.remove(&conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mclink_core::{Direction, PacketTag};

    fn chunk_packet_payload(tag: i32, x: i32, z: i32, full: bool) -> Vec<u8> {
        let mut payload = vec![tag as u8]; // single-byte varint in tests
        payload.extend_from_slice(&x.to_be_bytes());
        payload.extend_from_slice(&z.to_be_bytes());
        payload.push(full as u8);
        payload.extend_from_slice(&[0xAB; 32]); // opaque column data
        payload
    }

    #[test]
    fn test_parse_chunk_header() {
        let payload = chunk_packet_payload(0x21, 10, -3, true);
        let info = parse_chunk_header(&payload).expect("Failed to parse");
        assert_eq!(
            info,
            ChunkHeaderInfo {
                x: 10,
                z: -3,
                full: true
            }
        );
    }

    #[test]
    fn test_parse_partial_chunk() {
        let payload = chunk_packet_payload(0x21, 0, 0, false);
        let info = parse_chunk_header(&payload).expect("Failed to parse");
        assert!(!info.full);
    }

    #[test]
    fn test_parse_truncated_header_fails() {
        assert!(parse_chunk_header(&[0x21, 0, 0]).is_none());
        assert!(parse_chunk_header(&[]).is_none());
    }

    #[test]
    fn test_dimension_tracking_from_join_and_respawn() {
        let mut tracker = DimensionTracker::new(0x25, 0x3A);
        let conn = ConnectionId(1);
        assert_eq!(tracker.world_for(conn), 0);

        // Join game into the nether (-1).
        let mut join = vec![0x25];
        join.extend_from_slice(&77i32.to_be_bytes()); // entity id
        join.push(1); // gamemode
        join.extend_from_slice(&(-1i32).to_be_bytes()); // dimension
        tracker.observe(&Packet::new(
            conn,
            Direction::Clientbound,
            PacketTag(0x25),
            join,
        ));
        assert_eq!(tracker.world_for(conn), -1);

        // Respawn into the end (1).
        let mut respawn = vec![0x3A];
        respawn.extend_from_slice(&1i32.to_be_bytes());
        tracker.observe(&Packet::new(
            conn,
            Direction::Clientbound,
            PacketTag(0x3A),
            respawn,
        ));
        assert_eq!(tracker.world_for(conn), 1);

        tracker.forget(conn);
        assert_eq!(tracker.world_for(conn), 0);
    }

    #[test]
    fn test_unrelated_packets_ignored() {
        let mut tracker = DimensionTracker::new(0x25, 0x3A);
        let conn = ConnectionId(2);
        tracker.observe(&Packet::new(
            conn,
            Direction::Clientbound,
            PacketTag(0x0E),
            vec![0x0E, 1, 2, 3],
        ));
        assert_eq!(tracker.world_for(conn), 0);
    }
}
