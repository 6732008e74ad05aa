//! Wire frame codec for the inter-proxy link.
//!
//! Frame format (little-endian): `[length: u32][batch_sequence: u64][flag: u8][payload]`.
//! The length field counts everything after itself (sequence + flag + payload).

use thiserror::Error;

/// Bytes of header following the length field (sequence + flag).
pub const HEADER_LEN: usize = 8 + 1;

/// Upper bound for a single frame's length field. A batch is bounded by the
/// flush size threshold, so anything near this is corruption.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Decoding failures. A malformed frame is discarded and treated as a
/// sequence gap by the receiver; it is never fatal to the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Length field below the fixed header size.
    #[error("frame length {0} below minimum {HEADER_LEN}")]
    TooShort(usize),
    /// Length field beyond the sanity ceiling.
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    TooLarge(usize),
    /// Unknown flag byte.
    #[error("unknown frame flag: {0}")]
    BadFlag(u8),
    /// Buffer ended before the declared length.
    #[error("incomplete frame: expected {expected} bytes, got {got}")]
    Incomplete {
        /// Bytes the length field promised.
        expected: usize,
        /// Bytes actually available.
        got: usize,
    },
}

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameFlag {
    /// Compressed batch payload.
    Data = 0,
    /// Idle keepalive; the sequence field carries the sender's
    /// next-expected receive sequence as a running ack.
    Heartbeat = 1,
    /// Reconnect sync; payload is a postcard handshake body.
    Handshake = 2,
    /// The sequence number in this frame will never be delivered.
    GapMarker = 3,
}

impl TryFrom<u8> for FrameFlag {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameFlag::Data),
            1 => Ok(FrameFlag::Heartbeat),
            2 => Ok(FrameFlag::Handshake),
            3 => Ok(FrameFlag::GapMarker),
            other => Err(FrameError::BadFlag(other)),
        }
    }
}

/// One unit of the link protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Batch sequence number (or ack value for heartbeats).
    pub sequence: u64,
    /// Frame discriminator.
    pub flag: FrameFlag,
    /// Compressed batch bytes for data frames; empty or a handshake body
    /// for control frames.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Data frame carrying a compressed batch.
    pub fn data(sequence: u64, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            flag: FrameFlag::Data,
            payload,
        }
    }

    /// Heartbeat carrying a running ack.
    pub fn heartbeat(confirmed: u64) -> Self {
        Self {
            sequence: confirmed,
            flag: FrameFlag::Heartbeat,
            payload: Vec::new(),
        }
    }

    /// Handshake frame with an encoded body.
    pub fn handshake(body: Vec<u8>) -> Self {
        Self {
            sequence: 0,
            flag: FrameFlag::Handshake,
            payload: body,
        }
    }

    /// Gap marker for a sequence that will never arrive.
    pub fn gap_marker(sequence: u64) -> Self {
        Self {
            sequence,
            flag: FrameFlag::GapMarker,
            payload: Vec::new(),
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let length = (HEADER_LEN + self.payload.len()) as u32;
        let mut out = Vec::with_capacity(4 + HEADER_LEN + self.payload.len());
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.push(self.flag as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one frame from the start of `data`.
    ///
    /// Returns the frame and the total bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < 4 {
            return Err(FrameError::Incomplete {
                expected: 4,
                got: data.len(),
            });
        }
        let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if length < HEADER_LEN {
            return Err(FrameError::TooShort(length));
        }
        if length > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(length));
        }
        if data.len() < 4 + length {
            return Err(FrameError::Incomplete {
                expected: 4 + length,
                got: data.len(),
            });
        }

        let sequence = u64::from_le_bytes(data[4..12].try_into().expect("slice is 8 bytes"));
        let flag = FrameFlag::try_from(data[12])?;
        let payload = data[13..4 + length].to_vec();

        Ok((
            Self {
                sequence,
                flag,
                payload,
            },
            4 + length,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_data_frame() {
        let frame = Frame::data(42, vec![1, 2, 3, 4]);
        let encoded = frame.encode();
        let (decoded, consumed) = Frame::decode(&encoded).expect("Failed to decode");
        assert_eq!(decoded, frame);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_encode_decode_control_frames() {
        for frame in [
            Frame::heartbeat(7),
            Frame::handshake(vec![9, 9]),
            Frame::gap_marker(11),
        ] {
            let encoded = frame.encode();
            let (decoded, _) = Frame::decode(&encoded).expect("Failed to decode");
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_length_counts_header_and_payload() {
        let frame = Frame::data(1, vec![0; 10]);
        let encoded = frame.encode();
        let length = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(length as usize, HEADER_LEN + 10);
    }

    #[test]
    fn test_decode_bad_flag() {
        let mut encoded = Frame::data(1, vec![]).encode();
        encoded[12] = 200;
        assert_eq!(Frame::decode(&encoded), Err(FrameError::BadFlag(200)));
    }

    #[test]
    fn test_decode_truncated_frame() {
        let encoded = Frame::data(1, vec![1, 2, 3]).encode();
        let result = Frame::decode(&encoded[..encoded.len() - 1]);
        assert!(matches!(result, Err(FrameError::Incomplete { .. })));
    }

    #[test]
    fn test_decode_oversized_length() {
        let mut encoded = Frame::data(1, vec![]).encode();
        let bogus = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        encoded[..4].copy_from_slice(&bogus);
        assert!(matches!(Frame::decode(&encoded), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn test_decode_undersized_length() {
        let mut encoded = Frame::data(1, vec![]).encode();
        encoded[..4].copy_from_slice(&3u32.to_le_bytes());
        assert_eq!(Frame::decode(&encoded), Err(FrameError::TooShort(3)));
    }
}
