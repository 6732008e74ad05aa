//! Batching buffer: accumulates packets into time/size-bounded batches.
//!
//! One buffer exists per link direction. Packets are appended in arrival
//! order and swapped out as a `Batch` when the owning dispatch task's flush
//! timer fires (or early, when the pending bytes exceed the configured
//! threshold). Batch sequence numbers are gapless per link.

use mclink_core::{ConnectionId, PacketTag};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use anyhow::{Context, Result};

/// Identifier of one link direction's ordered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId(pub u64);

/// Chunk-cache substitution token, sent in place of a full chunk payload
/// when the sender knows the receiver already holds the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkToken {
    /// World/dimension identifier.
    pub world: i32,
    /// Chunk x coordinate.
    pub x: i32,
    /// Chunk z coordinate.
    pub z: i32,
    /// blake3 hash of the substituted payload.
    pub hash: [u8; 32],
}

/// One record inside a batch payload.
///
/// Connection control records ride the same ordered stream as packet data
/// so the peer observes opens, closes, and releases in the exact order
/// they happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchEntry {
    /// A game packet, payload opaque.
    Data {
        /// Owning connection.
        conn: ConnectionId,
        /// Leading packet-id varint.
        tag: PacketTag,
        /// Raw frame body.
        payload: Vec<u8>,
    },
    /// A chunk packet whose payload was replaced by a cache token.
    ChunkRef {
        /// Owning connection.
        conn: ConnectionId,
        /// Leading packet-id varint of the substituted packet.
        tag: PacketTag,
        /// Token the receiver resolves against its own cache.
        token: ChunkToken,
    },
    /// A new game client connected at the edge.
    OpenConnection {
        /// Connection to mirror on the origin side.
        conn: ConnectionId,
    },
    /// A proxied connection went away on either side.
    CloseConnection {
        /// Connection to tear down.
        conn: ConnectionId,
    },
    /// The origin-side connection is up; the edge may release packets it
    /// held back for this client.
    ReleaseHeld {
        /// Connection to release.
        conn: ConnectionId,
    },
}

impl BatchEntry {
    /// Approximate raw byte size, used for flush-threshold accounting.
    pub fn raw_len(&self) -> usize {
        match self {
            BatchEntry::Data { payload, .. } => payload.len(),
            // Control records and tokens are a few dozen bytes on the wire.
            BatchEntry::ChunkRef { .. } => 48,
            BatchEntry::OpenConnection { .. }
            | BatchEntry::CloseConnection { .. }
            | BatchEntry::ReleaseHeld { .. } => 16,
        }
    }
}

/// An ordered group of entries captured within one flush window.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Link direction this batch belongs to.
    pub link: LinkId,
    /// Monotonic, gapless sequence number.
    pub sequence: u64,
    /// Entries in arrival order.
    pub entries: Vec<BatchEntry>,
    /// Total raw bytes across entries.
    pub raw_len: usize,
    /// When the batch was flushed.
    pub created: Instant,
}

/// Serialize batch entries to the flat buffer handed to compression.
pub fn encode_entries(entries: &[BatchEntry]) -> Result<Vec<u8>> {
    postcard::to_allocvec(entries).context("Failed to serialize batch entries")
}

/// Inverse of [`encode_entries`].
pub fn decode_entries(data: &[u8]) -> Result<Vec<BatchEntry>> {
    postcard::from_bytes(data).context("Failed to deserialize batch entries")
}

/// Per-link pending queue with gapless flush sequencing.
pub struct BatchBuffer {
    link: LinkId,
    pending: Vec<BatchEntry>,
    pending_bytes: usize,
    next_sequence: u64,
    size_threshold: usize,
}

impl BatchBuffer {
    /// Create a buffer for one link direction.
    ///
    /// `size_threshold` is the pending-byte ceiling that forces an early
    /// flush; it bounds latency and memory under bursty traffic.
    pub fn new(link: LinkId, size_threshold: usize) -> Self {
        Self {
            link,
            pending: Vec::new(),
            pending_bytes: 0,
            next_sequence: 1,
            size_threshold,
        }
    }

    /// Append an entry in arrival order. O(1) amortized, never blocks.
    pub fn enqueue(&mut self, entry: BatchEntry) {
        self.pending_bytes += entry.raw_len();
        self.pending.push(entry);
    }

    /// True when pending bytes exceed the threshold and the owner should
    /// flush before the timer fires. Backpressure valve, not an error.
    pub fn should_flush_early(&self) -> bool {
        self.pending_bytes >= self.size_threshold
    }

    /// Swap the pending queue out as a batch with the next sequence number.
    ///
    /// Flushing an empty queue is a no-op and does not advance the counter:
    /// sequence numbers are only ever allocated to real batches, keeping
    /// the per-link numbering gapless.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            return None;
        }
        let entries = std::mem::take(&mut self.pending);
        let raw_len = std::mem::take(&mut self.pending_bytes);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Some(Batch {
            link: self.link,
            sequence,
            entries,
            raw_len,
            created: Instant::now(),
        })
    }

    /// Number of entries waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Raw bytes waiting for the next flush.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Sequence number the next flushed batch will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}
