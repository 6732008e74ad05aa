//! Property tests for the link ordering state machines: for any worker
//! completion order, wire order and delivery order equal batch order.

use mclink_net::{FrameFlag, Inbox, Outbox};
use proptest::prelude::*;

proptest! {
    /// Offers in any permutation emit in ascending sequence order.
    #[test]
    fn outbox_emits_ascending_for_any_completion_order(
        completion_order in Just((1u64..=24).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let n = completion_order.len() as u64;
        let mut outbox = Outbox::new(usize::MAX);
        let mut emitted = Vec::new();
        for seq in completion_order {
            outbox.offer(seq, vec![seq as u8]);
            for frame in outbox.ready() {
                emitted.push(frame.sequence);
            }
        }

        let expected: Vec<u64> = (1..=n).collect();
        prop_assert_eq!(emitted, expected);
    }

    /// Any mix of data frames, gap markers, and duplicates delivers each
    /// sequence at most once, strictly ascending, and never past a
    /// sequence the cursor has not reached.
    #[test]
    fn inbox_delivers_each_sequence_once_in_order(
        arrivals in proptest::collection::vec((1u64..=24, any::<bool>()), 1..64)
    ) {
        let mut inbox = Inbox::new();
        let mut delivered = Vec::new();
        for (seq, as_gap) in arrivals {
            let released = if as_gap {
                inbox.gap(seq)
            } else {
                inbox.accept(seq, vec![seq as u8])
            };
            for (sequence, _) in released {
                delivered.push(sequence);
            }
        }

        for pair in delivered.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
        if let Some(last) = delivered.last() {
            prop_assert!(*last <= inbox.confirmed());
        }
        // Gap-advanced sequences are counted by the cursor but never
        // delivered, so delivery count is bounded by the cursor.
        prop_assert!(delivered.len() as u64 <= inbox.confirmed());
    }

    /// Failed sequences surface as gap markers exactly where the sequence
    /// would have been.
    #[test]
    fn outbox_gap_markers_hold_their_position(fail_at in 1u64..=8) {
        let mut outbox = Outbox::new(usize::MAX);
        for seq in 1..=8u64 {
            if seq == fail_at {
                outbox.fail(seq);
            } else {
                outbox.offer(seq, vec![seq as u8]);
            }
        }

        let frames = outbox.ready();
        prop_assert_eq!(frames.len(), 8);
        for (i, frame) in frames.iter().enumerate() {
            prop_assert_eq!(frame.sequence, i as u64 + 1);
            if frame.sequence == fail_at {
                prop_assert_eq!(frame.flag, FrameFlag::GapMarker);
            } else {
                prop_assert_eq!(frame.flag, FrameFlag::Data);
            }
        }
    }
}
