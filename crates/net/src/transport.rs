//! TCP transport for the inter-proxy link.
//!
//! The internal proxy listens; the external proxy dials with jittered
//! exponential backoff. Frame I/O is plain length-prefixed reads/writes;
//! a corrupt length field loses stream framing and surfaces as a
//! connection-level error, while a recognizably-framed-but-malformed frame
//! is reported per frame so the receiver can treat it as a sequence gap.

use crate::frame::{Frame, FrameError, FrameFlag, HEADER_LEN, MAX_FRAME_LEN};
use anyhow::{Context, Result};
use mclink_core::BackoffConfig;
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Result of reading one frame off the wire.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A well-formed frame.
    Frame(Frame),
    /// Framing was intact but the content was not (unknown flag). The
    /// receiver treats the sequence as a gap rather than tearing down.
    Malformed {
        /// Sequence field of the discarded frame.
        sequence: u64,
    },
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer
        .write_all(&frame.encode())
        .await
        .context("Failed to write link frame")
}

/// Read one frame.
///
/// Errors mean stream framing is unrecoverable (socket error, EOF, or an
/// insane length field) and the connection must be re-established.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ReadOutcome> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .context("Failed to read frame length")?;
    let length = u32::from_le_bytes(len_bytes) as usize;
    if length < HEADER_LEN {
        return Err(FrameError::TooShort(length).into());
    }
    if length > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(length).into());
    }

    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read frame body")?;

    let sequence = u64::from_le_bytes(body[0..8].try_into().expect("slice is 8 bytes"));
    match FrameFlag::try_from(body[8]) {
        Ok(flag) => Ok(ReadOutcome::Frame(Frame {
            sequence,
            flag,
            payload: body[9..].to_vec(),
        })),
        Err(err) => {
            warn!("Discarding malformed frame (seq {}): {}", sequence, err);
            Ok(ReadOutcome::Malformed { sequence })
        }
    }
}

/// Jittered exponential backoff state for link reconnection.
pub struct ReconnectBackoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl ReconnectBackoff {
    /// Create from config.
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_ms.max(1));
        Self {
            current: initial,
            initial,
            max: Duration::from_millis(config.max_ms.max(config.initial_ms.max(1))),
            multiplier: config.multiplier.max(1.0),
        }
    }

    /// Delay before the next attempt; grows until the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let grown = base.as_secs_f64() * self.multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.max.as_secs_f64()));
        // +/-10% jitter keeps both sides from reconnecting in lockstep.
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        Duration::from_secs_f64(base.as_secs_f64() * jitter)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How this side obtains the link connection.
pub enum LinkEndpoint {
    /// Accept the peer (internal proxy side).
    Listener(TcpListener),
    /// Dial the peer with backoff (external proxy side).
    Dial {
        /// Peer address.
        peer: SocketAddr,
        /// Reconnect backoff state.
        backoff: ReconnectBackoff,
    },
}

impl LinkEndpoint {
    /// Bind a listener. Failure here is a startup misconfiguration and is
    /// surfaced loudly rather than retried.
    pub async fn listen(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind link listener on {addr}"))?;
        info!("Link listener bound on {}", listener.local_addr()?);
        Ok(Self::Listener(listener))
    }

    /// Prepare to dial the peer.
    pub fn dial(peer: SocketAddr, backoff: &BackoffConfig) -> Self {
        Self::Dial {
            peer,
            backoff: ReconnectBackoff::new(backoff),
        }
    }

    /// Local address of the listener variant, mainly for tests.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Listener(listener) => listener.local_addr().ok(),
            Self::Dial { .. } => None,
        }
    }

    /// Obtain the next link connection, retrying transient failures.
    pub async fn establish(&mut self) -> Result<TcpStream> {
        match self {
            Self::Listener(listener) => loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!("Link peer connected from {}", peer);
                        stream.set_nodelay(true).ok();
                        return Ok(stream);
                    }
                    Err(err) => {
                        warn!("Link accept failed: {}", err);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            },
            Self::Dial { peer, backoff } => loop {
                match TcpStream::connect(*peer).await {
                    Ok(stream) => {
                        info!("Link established to {}", peer);
                        backoff.reset();
                        stream.set_nodelay(true).ok();
                        return Ok(stream);
                    }
                    Err(err) => {
                        let delay = backoff.next_delay();
                        debug!(
                            "Link connect to {} failed ({}); retrying in {:?}",
                            peer, err, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            },
        }
    }
}
