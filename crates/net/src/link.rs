//! Send- and receive-side sequencing state for one link direction.
//!
//! Compression completes out of order; the wire must carry batches in
//! strictly ascending sequence order, and delivery to the egress path must
//! match receive order. `Outbox` and `Inbox` are the two authoritative
//! serialization points. Both are plain state machines driven by the link
//! driver task; neither does I/O.

use crate::frame::Frame;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Gaps tolerated between handshakes before the receiver forces a full
/// reconnect/resync instead of limping along.
pub const MAX_GAPS_BEFORE_RESYNC: u64 = 64;

/// Handshake body exchanged on (re)connect.
///
/// Each side reports the highest sequence it has contiguously received;
/// the lower of the two views is authoritative and transmission resumes
/// just above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeBody {
    /// Highest contiguously received sequence (0 when nothing yet).
    pub confirmed: u64,
}

impl HandshakeBody {
    /// Encode for a handshake frame payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).context("Failed to encode handshake body")
    }

    /// Decode from a handshake frame payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data).context("Failed to decode handshake body")
    }
}

enum OutboxEntry {
    /// Compressed batch retained until the peer confirms it.
    Data(Vec<u8>),
    /// Sequence that will never carry data (failed compression, or dropped
    /// under the buffer ceiling); transmitted as a gap marker.
    Gap,
}

/// Send-side reorder and retransmit buffer.
///
/// Accepts compressed frames in completion order, emits them in strict
/// sequence order, and retains everything unconfirmed up to a byte ceiling
/// so a reconnect can resume without loss. Past the ceiling the oldest
/// entries are dropped oldest-first and remembered as gaps.
pub struct Outbox {
    entries: BTreeMap<u64, OutboxEntry>,
    /// Next sequence to hand to the socket.
    next_emit: u64,
    /// Highest sequence the peer has confirmed.
    acked: u64,
    data_bytes: usize,
    ceiling: usize,
}

impl Outbox {
    /// Create an outbox with the given retained-byte ceiling.
    pub fn new(ceiling: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_emit: 1,
            acked: 0,
            data_bytes: 0,
            ceiling,
        }
    }

    /// Accept a compressed batch in completion order.
    pub fn offer(&mut self, sequence: u64, payload: Vec<u8>) {
        if sequence <= self.acked {
            // A retry completed after the peer already confirmed it.
            return;
        }
        self.data_bytes += payload.len();
        self.entries.insert(sequence, OutboxEntry::Data(payload));
        self.enforce_ceiling();
    }

    /// Record a permanently failed sequence; the peer gets a gap marker so
    /// it does not wait forever.
    pub fn fail(&mut self, sequence: u64) {
        if sequence <= self.acked {
            return;
        }
        if let Some(OutboxEntry::Data(old)) = self
            .entries
            .insert(sequence, OutboxEntry::Gap)
        {
            self.data_bytes -= old.len();
        }
    }

    /// Frames ready to transmit now: the contiguous run starting at the
    /// next unemitted sequence. Entries stay retained for retransmission
    /// until [`Outbox::ack`] covers them.
    pub fn ready(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(entry) = self.entries.get(&self.next_emit) {
            let frame = match entry {
                OutboxEntry::Data(payload) => Frame::data(self.next_emit, payload.clone()),
                OutboxEntry::Gap => Frame::gap_marker(self.next_emit),
            };
            out.push(frame);
            self.next_emit += 1;
        }
        out
    }

    /// Drop everything the peer has confirmed receiving.
    pub fn ack(&mut self, confirmed: u64) {
        if confirmed <= self.acked {
            return;
        }
        let keep = self.entries.split_off(&(confirmed + 1));
        for (_, entry) in std::mem::replace(&mut self.entries, keep) {
            if let OutboxEntry::Data(payload) = entry {
                self.data_bytes -= payload.len();
            }
        }
        self.acked = confirmed;
        if self.next_emit <= confirmed {
            self.next_emit = confirmed + 1;
        }
    }

    /// Apply the reconnect handshake: resume transmission just above the
    /// lower of the two confirmed views.
    ///
    /// When the peer reports less than we believed confirmed (it lost
    /// state), the sequences we already pruned can never be re-sent; they
    /// are re-registered as gaps so the peer's reorder logic can advance
    /// past them.
    pub fn rewind(&mut self, peer_confirmed: u64) {
        if peer_confirmed < self.acked {
            warn!(
                "Peer confirmed {} but we had pruned through {}; resending with gaps",
                peer_confirmed, self.acked
            );
            for sequence in peer_confirmed + 1..=self.acked {
                self.entries.entry(sequence).or_insert(OutboxEntry::Gap);
            }
            self.acked = peer_confirmed;
        } else {
            self.ack(peer_confirmed);
        }
        self.next_emit = self.acked + 1;
        debug!("Outbox rewound; resuming from sequence {}", self.next_emit);
    }

    /// Retained payload bytes (gap entries are free).
    pub fn buffered_bytes(&self) -> usize {
        self.data_bytes
    }

    /// Retained entry count.
    pub fn pending_len(&self) -> usize {
        self.entries.len()
    }

    fn enforce_ceiling(&mut self) {
        while self.data_bytes > self.ceiling {
            // Oldest data entry goes first; its sequence becomes a recorded
            // gap so the receiver never stalls waiting for it.
            let oldest = self
                .entries
                .iter()
                .find_map(|(seq, entry)| match entry {
                    OutboxEntry::Data(_) => Some(*seq),
                    OutboxEntry::Gap => None,
                });
            let Some(sequence) = oldest else { break };
            if let Some(OutboxEntry::Data(payload)) =
                self.entries.insert(sequence, OutboxEntry::Gap)
            {
                self.data_bytes -= payload.len();
            }
            warn!(
                "Send buffer over ceiling; dropped batch seq {} and recorded a gap",
                sequence
            );
            // The drop may concern an already-emitted sequence; if the peer
            // received it the later gap marker is ignored as a duplicate.
        }
    }
}

/// Receive-side reorder buffer.
///
/// Frames arriving above `next_expected` are held; contiguous runs are
/// released in order. Gap markers (and locally discarded malformed frames)
/// let the cursor advance past sequences that will never arrive.
pub struct Inbox {
    pending: BTreeMap<u64, Vec<u8>>,
    skipped: BTreeSet<u64>,
    next_expected: u64,
    gaps_since_sync: u64,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    /// Create an inbox expecting sequence 1 first.
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            skipped: BTreeSet::new(),
            next_expected: 1,
            gaps_since_sync: 0,
        }
    }

    /// Accept a data frame; returns the contiguous run now deliverable, in
    /// sequence order. Duplicates and already-delivered sequences are
    /// ignored (retransmission after reconnect produces them legitimately).
    pub fn accept(&mut self, sequence: u64, payload: Vec<u8>) -> Vec<(u64, Vec<u8>)> {
        if sequence < self.next_expected {
            return Vec::new();
        }
        self.pending.insert(sequence, payload);
        self.drain()
    }

    /// Record that a sequence will never arrive; returns any frames the
    /// advancing cursor releases.
    pub fn gap(&mut self, sequence: u64) -> Vec<(u64, Vec<u8>)> {
        if sequence < self.next_expected {
            return Vec::new();
        }
        self.skipped.insert(sequence);
        self.drain()
    }

    /// Highest contiguously received sequence, for handshakes and
    /// heartbeat acks.
    pub fn confirmed(&self) -> u64 {
        self.next_expected - 1
    }

    /// True when accumulated gaps warrant a forced reconnect/resync.
    pub fn needs_resync(&self) -> bool {
        self.gaps_since_sync >= MAX_GAPS_BEFORE_RESYNC
    }

    /// Reset the gap counter after a successful handshake.
    pub fn mark_synced(&mut self) {
        self.gaps_since_sync = 0;
    }

    /// Frames currently held waiting for a lower sequence.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        loop {
            if let Some(payload) = self.pending.remove(&self.next_expected) {
                out.push((self.next_expected, payload));
                self.next_expected += 1;
            } else if self.skipped.remove(&self.next_expected) {
                self.gaps_since_sync += 1;
                self.next_expected += 1;
            } else {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFlag;

    fn payload(byte: u8) -> Vec<u8> {
        vec![byte; 4]
    }

    #[test]
    fn test_outbox_emits_in_sequence_order() {
        // Worker B finishes #2 before worker A finishes #1; the wire must
        // still carry #1 first.
        let mut outbox = Outbox::new(1024);
        outbox.offer(2, payload(2));
        assert!(outbox.ready().is_empty());

        outbox.offer(1, payload(1));
        let frames = outbox.ready();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence, 1);
        assert_eq!(frames[1].sequence, 2);
    }

    #[test]
    fn test_outbox_emits_each_sequence_once() {
        let mut outbox = Outbox::new(1024);
        outbox.offer(1, payload(1));
        assert_eq!(outbox.ready().len(), 1);
        assert!(outbox.ready().is_empty());

        outbox.offer(2, payload(2));
        let frames = outbox.ready();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sequence, 2);
    }

    #[test]
    fn test_outbox_failure_becomes_gap_marker() {
        let mut outbox = Outbox::new(1024);
        outbox.offer(2, payload(2));
        outbox.fail(1);
        let frames = outbox.ready();
        assert_eq!(frames[0].flag, FrameFlag::GapMarker);
        assert_eq!(frames[0].sequence, 1);
        assert_eq!(frames[1].flag, FrameFlag::Data);
    }

    #[test]
    fn test_outbox_retains_until_ack() {
        let mut outbox = Outbox::new(1024);
        outbox.offer(1, payload(1));
        outbox.offer(2, payload(2));
        outbox.ready();
        assert_eq!(outbox.pending_len(), 2);

        outbox.ack(1);
        assert_eq!(outbox.pending_len(), 1);
        assert_eq!(outbox.buffered_bytes(), 4);

        outbox.ack(2);
        assert_eq!(outbox.pending_len(), 0);
        assert_eq!(outbox.buffered_bytes(), 0);
    }

    #[test]
    fn test_outbox_rewind_resends_unconfirmed_only() {
        let mut outbox = Outbox::new(1024);
        for seq in 1..=4 {
            outbox.offer(seq, payload(seq as u8));
        }
        outbox.ready();
        outbox.ack(2);

        // Peer's handshake agrees with our ack state: resume at 3.
        outbox.rewind(2);
        let frames = outbox.ready();
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
    }

    #[test]
    fn test_outbox_rewind_ignores_confirmed_frames() {
        // Peer confirms more than our running-ack knew about; nothing the
        // receiver confirmed is retransmitted.
        let mut outbox = Outbox::new(1024);
        for seq in 1..=3 {
            outbox.offer(seq, payload(seq as u8));
        }
        outbox.ready();
        outbox.rewind(3);
        assert!(outbox.ready().is_empty());
        assert_eq!(outbox.pending_len(), 0);
    }

    #[test]
    fn test_outbox_rewind_past_pruned_state_records_gaps() {
        // Peer crash-restarted and reports less than we pruned; the lower
        // value is authoritative and the missing range resends as gaps.
        let mut outbox = Outbox::new(1024);
        for seq in 1..=3 {
            outbox.offer(seq, payload(seq as u8));
        }
        outbox.ready();
        outbox.ack(2);

        outbox.rewind(0);
        let frames = outbox.ready();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].flag, FrameFlag::GapMarker);
        assert_eq!(frames[1].flag, FrameFlag::GapMarker);
        assert_eq!(frames[2].flag, FrameFlag::Data);
        assert_eq!(frames[2].sequence, 3);
    }

    #[test]
    fn test_outbox_ceiling_drops_oldest_first() {
        let mut outbox = Outbox::new(10);
        outbox.offer(1, vec![0; 6]);
        outbox.offer(2, vec![0; 6]);
        // Over ceiling: seq 1 converts to a gap, seq 2 survives.
        assert_eq!(outbox.buffered_bytes(), 6);

        let frames = outbox.ready();
        assert_eq!(frames[0].flag, FrameFlag::GapMarker);
        assert_eq!(frames[0].sequence, 1);
        assert_eq!(frames[1].flag, FrameFlag::Data);
        assert_eq!(frames[1].sequence, 2);
    }

    #[test]
    fn test_outbox_late_retry_after_ack_is_ignored() {
        let mut outbox = Outbox::new(1024);
        outbox.offer(1, payload(1));
        outbox.ready();
        outbox.ack(1);
        outbox.offer(1, payload(1));
        assert_eq!(outbox.pending_len(), 0);
    }

    #[test]
    fn test_inbox_orders_out_of_order_arrivals() {
        let mut inbox = Inbox::new();
        assert!(inbox.accept(2, payload(2)).is_empty());
        assert!(inbox.accept(3, payload(3)).is_empty());

        let released = inbox.accept(1, payload(1));
        let sequences: Vec<u64> = released.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(inbox.confirmed(), 3);
    }

    #[test]
    fn test_inbox_gap_advances_cursor() {
        let mut inbox = Inbox::new();
        assert!(inbox.accept(2, payload(2)).is_empty());
        let released = inbox.gap(1);
        let sequences: Vec<u64> = released.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, vec![2]);
        assert_eq!(inbox.confirmed(), 2);
    }

    #[test]
    fn test_inbox_ignores_duplicates_below_cursor() {
        let mut inbox = Inbox::new();
        inbox.accept(1, payload(1));
        assert!(inbox.accept(1, payload(1)).is_empty());
        assert_eq!(inbox.confirmed(), 1);
    }

    #[test]
    fn test_inbox_resync_threshold() {
        let mut inbox = Inbox::new();
        for seq in 1..=MAX_GAPS_BEFORE_RESYNC {
            inbox.gap(seq);
        }
        assert!(inbox.needs_resync());
        inbox.mark_synced();
        assert!(!inbox.needs_resync());
    }

    #[test]
    fn test_handshake_body_roundtrip() {
        let body = HandshakeBody { confirmed: 41 };
        let encoded = body.encode().expect("Failed to encode");
        let decoded = HandshakeBody::decode(&encoded).expect("Failed to decode");
        assert_eq!(decoded, body);
    }
}
