//! Registry of live proxied connections and their egress writers.
//!
//! Each connection gets a dedicated writer task so one slow client cannot
//! stall the delivery path; the registry only hands out channel senders.

use mclink_core::{ConnectionId, Packet};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::adapter::PacketSink;

/// Shared map of connection id to egress channel.
#[derive(Clone, Default)]
pub struct SinkRegistry {
    inner: Arc<Mutex<HashMap<ConnectionId, mpsc::Sender<Packet>>>>,
}

impl SinkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's write half and spawn its writer task.
    pub fn insert<W>(&self, conn: ConnectionId, writer: W)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Packet>(256);
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .insert(conn, tx);

        tokio::spawn(async move {
            let mut sink = PacketSink::new(writer);
            while let Some(packet) = rx.recv().await {
                if let Err(err) = sink.write(&packet).await {
                    debug!("Egress write for {} failed: {:#}", packet.conn, err);
                    break;
                }
            }
            // Dropping the sink closes the socket's write half.
        });
    }

    /// Remove a connection; its writer task ends once the channel drains.
    pub fn remove(&self, conn: ConnectionId) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .remove(&conn);
    }

    /// True when the connection is still registered.
    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .contains_key(&conn)
    }

    /// Queue a packet for a connection's writer.
    ///
    /// A missing or dead connection drops the packet: the close control
    /// record is already on its way in one direction or the other.
    pub async fn send_to(&self, conn: ConnectionId, packet: Packet) {
        let sender = {
            let map = self.inner.lock().expect("registry lock poisoned");
            map.get(&conn).cloned()
        };
        match sender {
            Some(sender) => {
                if sender.send(packet).await.is_err() {
                    warn!("Writer for {} is gone; dropping packet", conn);
                    self.remove(conn);
                }
            }
            None => debug!("No egress for {}; dropping packet", conn),
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    /// True when no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mclink_core::{Direction, PacketTag};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_send_to_writes_framed_packet() {
        let registry = SinkRegistry::new();
        let (tx, mut rx) = tokio::io::duplex(4096);
        let conn = ConnectionId(1);
        registry.insert(conn, tx);

        registry
            .send_to(
                conn,
                Packet::new(conn, Direction::Clientbound, PacketTag(0x10), vec![0x10, 0xAA]),
            )
            .await;

        let mut buf = [0u8; 3];
        rx.read_exact(&mut buf).await.expect("Failed to read");
        assert_eq!(buf, [2, 0x10, 0xAA]);
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection_is_dropped() {
        let registry = SinkRegistry::new();
        registry
            .send_to(
                ConnectionId(9),
                Packet::new(
                    ConnectionId(9),
                    Direction::Clientbound,
                    PacketTag(0),
                    vec![0],
                ),
            )
            .await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_closes_writer() {
        let registry = SinkRegistry::new();
        let (tx, mut rx) = tokio::io::duplex(4096);
        let conn = ConnectionId(2);
        registry.insert(conn, tx);
        registry.remove(conn);
        assert!(!registry.contains(conn));

        // Writer task ends and the duplex write half drops: EOF.
        let mut buf = [0u8; 1];
        let read = rx.read(&mut buf).await.expect("Failed to read");
        assert_eq!(read, 0);
    }
}
