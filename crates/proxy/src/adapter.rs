//! Packet ingress/egress adapters.
//!
//! The game protocol's outer framing is a varint length prefix; everything
//! inside stays opaque apart from the leading packet-id varint, which is
//! captured as the routing tag. Field semantics are never interpreted.

use anyhow::{Context, Result};
use mclink_core::{ConnectionId, Direction, Packet, PacketTag};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted game frame. The protocol caps packets at 2^21 bytes;
/// anything above that is a desynced or hostile connection.
pub const MAX_GAME_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Parse one varint from the front of a buffer.
///
/// Returns the value and the bytes consumed.
pub(crate) fn parse_varint(data: &[u8]) -> Result<(i32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in data.iter().enumerate().take(5) {
        value |= ((byte & 0x7F) as u32) << (i * 7);
        if byte & 0x80 == 0 {
            return Ok((value as i32, i + 1));
        }
    }
    Err(anyhow::anyhow!("Truncated or oversized varint"))
}

/// Append a protocol varint to a buffer.
fn push_varint(buf: &mut Vec<u8>, value: i32) {
    let mut remaining = value as u32;
    loop {
        let byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        if remaining == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Ingress adapter: a restartable lazy sequence of packets from one live
/// connection's read half.
pub struct PacketStream<R> {
    reader: R,
    conn: ConnectionId,
    direction: Direction,
}

impl<R: AsyncRead + Unpin> PacketStream<R> {
    /// Wrap a read half.
    pub fn new(reader: R, conn: ConnectionId, direction: Direction) -> Self {
        Self {
            reader,
            conn,
            direction,
        }
    }

    /// Read the next packet. `Ok(None)` means the connection closed
    /// cleanly at a frame boundary; errors mean the connection is
    /// unusable and should be torn down.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>> {
        // A clean close surfaces as EOF on the first length byte.
        let first = match self.reader.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err).context("Failed to read frame length"),
        };

        let length = if first & 0x80 == 0 {
            first as usize
        } else {
            let mut value = (first & 0x7F) as u32;
            let mut done = false;
            for shift in 1..5 {
                let byte = self.reader.read_u8().await.context("Failed to read frame length")?;
                value |= ((byte & 0x7F) as u32) << (shift * 7);
                if byte & 0x80 == 0 {
                    done = true;
                    break;
                }
            }
            if !done {
                anyhow::bail!("Frame length varint longer than 5 bytes");
            }
            value as usize
        };

        if length == 0 || length > MAX_GAME_FRAME_LEN {
            anyhow::bail!("Unreasonable game frame length: {}", length);
        }

        let mut payload = vec![0u8; length];
        self.reader
            .read_exact(&mut payload)
            .await
            .context("Failed to read frame body")?;

        let (tag, _) = parse_varint(&payload).context("Failed to read packet id")?;

        Ok(Some(Packet::new(
            self.conn,
            self.direction,
            PacketTag(tag),
            payload,
        )))
    }
}

/// Egress adapter: writes packets back out with the varint length prefix.
pub struct PacketSink<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> PacketSink<W> {
    /// Wrap a write half.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one packet frame.
    pub async fn write(&mut self, packet: &Packet) -> Result<()> {
        let mut frame = Vec::with_capacity(5 + packet.payload.len());
        push_varint(&mut frame, packet.payload.len() as i32);
        frame.extend_from_slice(&packet.payload);
        self.writer
            .write_all(&frame)
            .await
            .context("Failed to write packet frame")
    }
}
