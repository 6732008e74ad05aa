//! Link driver: one task that owns the socket, the outbox, and the inbox
//! for a proxy pair's connection.
//!
//! Compressed frames arrive from the pipeline in completion order via
//! [`SenderCmd`]; ordered received payloads leave on the delivery channel.
//! The driver re-establishes the connection with handshake resync whenever
//! the session dies, so callers never observe the reconnect machinery.

use crate::frame::{Frame, FrameFlag};
use crate::link::{HandshakeBody, Inbox, Outbox};
use crate::transport::{read_frame, write_frame, LinkEndpoint, ReadOutcome};
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Input to the driver from the compression side.
#[derive(Debug)]
pub enum SenderCmd {
    /// A compressed batch completed; may arrive in any order.
    Offer {
        /// Batch sequence number.
        sequence: u64,
        /// Compressed bytes.
        payload: Vec<u8>,
    },
    /// The pipeline gave up on this sequence; the peer gets a gap marker.
    Fail {
        /// Batch sequence number that will never complete.
        sequence: u64,
    },
}

enum SessionEnd {
    /// Caller hung up; stop for good.
    Shutdown,
}

/// Owns one link direction pair's connection and ordering state.
pub struct LinkDriver {
    endpoint: LinkEndpoint,
    outbox: Outbox,
    inbox: Inbox,
    heartbeat_interval: Duration,
    handshake_timeout: Duration,
}

impl LinkDriver {
    /// Create a driver with the configured send-buffer ceiling.
    pub fn new(endpoint: LinkEndpoint, send_ceiling_bytes: usize) -> Self {
        Self {
            endpoint,
            outbox: Outbox::new(send_ceiling_bytes),
            inbox: Inbox::new(),
            heartbeat_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Override the heartbeat cadence.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Run until the command channel closes.
    ///
    /// `cmd_rx` feeds compressed frames and failures from the pipeline;
    /// `deliver_tx` receives `(sequence, compressed_payload)` pairs in
    /// strict sequence order.
    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SenderCmd>,
        deliver_tx: mpsc::Sender<(u64, Vec<u8>)>,
    ) -> Result<()> {
        loop {
            let stream = self.endpoint.establish().await?;
            match self.session(stream, &mut cmd_rx, &deliver_tx).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("Link driver shutting down");
                    return Ok(());
                }
                Err(err) => {
                    warn!("Link session ended: {:#}; reconnecting", err);
                }
            }
        }
    }

    async fn session(
        &mut self,
        stream: TcpStream,
        cmd_rx: &mut mpsc::Receiver<SenderCmd>,
        deliver_tx: &mpsc::Sender<(u64, Vec<u8>)>,
    ) -> Result<SessionEnd> {
        let (mut rd, mut wr) = stream.into_split();

        // Dedicated reader task; frame reads are not cancellation-safe in a
        // select arm, channel receives are.
        let (net_tx, mut net_rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut rd).await {
                    Ok(outcome) => {
                        if net_tx.send(outcome).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!("Link read ended: {:#}", err);
                        break;
                    }
                }
            }
        });

        let result = self
            .session_loop(&mut wr, &mut net_rx, cmd_rx, deliver_tx)
            .await;
        reader.abort();
        result
    }

    async fn session_loop<W: AsyncWrite + Unpin>(
        &mut self,
        wr: &mut W,
        net_rx: &mut mpsc::Receiver<ReadOutcome>,
        cmd_rx: &mut mpsc::Receiver<SenderCmd>,
        deliver_tx: &mpsc::Sender<(u64, Vec<u8>)>,
    ) -> Result<SessionEnd> {
        // Handshake: exchange confirmed sequences so neither side discards
        // data the other has not seen.
        let hello = HandshakeBody {
            confirmed: self.inbox.confirmed(),
        };
        write_frame(wr, &Frame::handshake(hello.encode()?)).await?;

        let peer = tokio::time::timeout(self.handshake_timeout, await_handshake(net_rx))
            .await
            .context("Timed out waiting for link handshake")??;
        self.outbox.rewind(peer.confirmed);
        self.inbox.mark_synced();
        info!(
            "Link synchronized: peer confirmed {}, we confirmed {}",
            peer.confirmed, hello.confirmed
        );

        self.flush(wr).await?;

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_rx = Instant::now();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None => return Ok(SessionEnd::Shutdown),
                    Some(SenderCmd::Offer { sequence, payload }) => {
                        self.outbox.offer(sequence, payload);
                        self.flush(wr).await?;
                    }
                    Some(SenderCmd::Fail { sequence }) => {
                        self.outbox.fail(sequence);
                        self.flush(wr).await?;
                    }
                },
                outcome = net_rx.recv() => {
                    let Some(outcome) = outcome else {
                        anyhow::bail!("Link connection lost");
                    };
                    last_rx = Instant::now();
                    if self.handle_inbound(wr, outcome, deliver_tx).await?.is_some() {
                        return Ok(SessionEnd::Shutdown);
                    }
                    if self.inbox.needs_resync() {
                        anyhow::bail!("Receive gap tolerance exceeded; forcing resync");
                    }
                },
                _ = heartbeat.tick() => {
                    if last_rx.elapsed() > self.heartbeat_interval * 4 {
                        anyhow::bail!("No traffic from peer; connection is half-open");
                    }
                    write_frame(wr, &Frame::heartbeat(self.inbox.confirmed())).await?;
                }
            }
        }
    }

    /// Returns `Some(())` when the delivery channel is gone (shutdown).
    async fn handle_inbound<W: AsyncWrite + Unpin>(
        &mut self,
        wr: &mut W,
        outcome: ReadOutcome,
        deliver_tx: &mpsc::Sender<(u64, Vec<u8>)>,
    ) -> Result<Option<()>> {
        let released = match outcome {
            ReadOutcome::Malformed { sequence } => {
                warn!("Treating malformed frame seq {} as a gap", sequence);
                self.inbox.gap(sequence)
            }
            ReadOutcome::Frame(frame) => match frame.flag {
                FrameFlag::Data => self.inbox.accept(frame.sequence, frame.payload),
                FrameFlag::GapMarker => {
                    debug!("Peer marked seq {} as a permanent gap", frame.sequence);
                    self.inbox.gap(frame.sequence)
                }
                FrameFlag::Heartbeat => {
                    self.outbox.ack(frame.sequence);
                    Vec::new()
                }
                FrameFlag::Handshake => {
                    // A mid-session handshake means the peer resynced; honor
                    // its confirmed view and resend from there.
                    let body = HandshakeBody::decode(&frame.payload)?;
                    self.outbox.rewind(body.confirmed);
                    self.inbox.mark_synced();
                    self.flush(wr).await?;
                    Vec::new()
                }
            },
        };

        for (sequence, payload) in released {
            if deliver_tx.send((sequence, payload)).await.is_err() {
                return Ok(Some(()));
            }
        }
        Ok(None)
    }

    async fn flush<W: AsyncWrite + Unpin>(&mut self, wr: &mut W) -> Result<()> {
        for frame in self.outbox.ready() {
            write_frame(wr, &frame).await?;
        }
        Ok(())
    }
}

async fn await_handshake(net_rx: &mut mpsc::Receiver<ReadOutcome>) -> Result<HandshakeBody> {
    loop {
        match net_rx.recv().await {
            Some(ReadOutcome::Frame(frame)) if frame.flag == FrameFlag::Handshake => {
                return HandshakeBody::decode(&frame.payload);
            }
            // Frames from a torn-down session may still be in flight;
            // nothing is trusted until the handshake lands.
            Some(other) => debug!("Ignoring pre-handshake traffic: {:?}", other),
            None => anyhow::bail!("Link closed during handshake"),
        }
    }
}
