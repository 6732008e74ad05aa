//! Internal (origin-side) proxy: mirrors each proxied client as a TCP
//! connection to the real server, and batches the origin's traffic back
//! over the link with chunk-cache substitution.

use crate::adapter::PacketStream;
use crate::chunk::{parse_chunk_header, DimensionTracker};
use crate::registry::SinkRegistry;
use crate::relay::{self, DispatchMsg};
use anyhow::{Context, Result};
use mclink_cache::{chunk_hash, ChunkCache, ChunkKey, Outcome};
use mclink_core::{Config, ConnectionId, Direction, HookChain, Packet};
use mclink_net::{
    spawn_pipeline, BatchBuffer, BatchEntry, ChunkToken, LinkDriver, LinkEndpoint, LinkId,
    PipelineHandle, SenderCmd,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// The origin side's single inter-proxy link.
const LINK: LinkId = LinkId(0);

/// The origin-side proxy process.
pub struct InternalProxy {
    config: Config,
    link_endpoint: LinkEndpoint,
    origin_addr: SocketAddr,
}

impl InternalProxy {
    /// Resolve addresses and bind the link listener. Any failure here is a
    /// startup misconfiguration and is surfaced immediately.
    pub async fn bind(config: Config) -> Result<Self> {
        let link_bind = Config::resolve_addr(&config.link_bind)?;
        let origin_addr = Config::resolve_addr(&config.origin_addr)?;
        let link_endpoint = LinkEndpoint::listen(link_bind).await?;
        info!("Internal proxy ready; origin server at {}", origin_addr);
        Ok(Self {
            config,
            link_endpoint,
            origin_addr,
        })
    }

    /// Address the external proxy should dial.
    pub fn link_addr(&self) -> Result<SocketAddr> {
        self.link_endpoint
            .local_addr()
            .context("Link listener has no local address")
    }

    /// Run until shutdown. `pre_hooks` runs per origin packet before
    /// batching; `post_hooks` runs per delivered client packet before it
    /// is forwarded to the origin.
    pub async fn run(self, pre_hooks: HookChain, post_hooks: HookChain) -> Result<()> {
        let config = self.config;
        let cache = ChunkCache::open(
            config.cache.memory_budget_bytes,
            config.cache.disk_path.clone(),
        )?;

        let (pipeline, pipeline_events) = spawn_pipeline(config.worker_count);
        let (link_cmd_tx, link_cmd_rx) = mpsc::channel(256);
        let (deliver_tx, deliver_rx) = mpsc::channel(256);
        let (batches_tx, batches_rx) = mpsc::channel(256);

        let driver = LinkDriver::new(self.link_endpoint, config.send_buffer_ceiling_bytes);
        tokio::spawn(async move {
            if let Err(err) = driver.run(link_cmd_rx, deliver_tx).await {
                error!("Link driver failed: {:#}", err);
            }
        });
        tokio::spawn(relay::route_pipeline_events(
            pipeline_events,
            link_cmd_tx.clone(),
            batches_tx,
        ));
        tokio::spawn(relay::feed_decompression(LINK, deliver_rx, pipeline.clone()));

        let registry = SinkRegistry::new();
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1024);

        let tracker = DimensionTracker::new(config.join_game_tag, config.respawn_tag);
        tokio::spawn(run_dispatch(
            Duration::from_millis(config.flush_interval_ms),
            config.flush_size_threshold_bytes,
            dispatch_rx,
            pre_hooks,
            pipeline,
            link_cmd_tx,
            cache,
            tracker,
            config.chunk_tags,
        ));

        deliver_loop(
            batches_rx,
            registry,
            post_hooks,
            dispatch_tx,
            self.origin_addr,
        )
        .await
    }
}

/// Clientbound dispatch: hooks, dimension tracking, chunk substitution,
/// batching.
#[allow(clippy::too_many_arguments)]
async fn run_dispatch(
    flush_interval: Duration,
    flush_threshold: usize,
    mut dispatch_rx: mpsc::Receiver<DispatchMsg>,
    mut pre_hooks: HookChain,
    pipeline: PipelineHandle,
    link_cmd_tx: mpsc::Sender<SenderCmd>,
    mut cache: ChunkCache,
    mut tracker: DimensionTracker,
    chunk_tags: Vec<i32>,
) {
    let mut buffer = BatchBuffer::new(LINK, flush_threshold);
    let mut flush_timer = tokio::time::interval(flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = dispatch_rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    DispatchMsg::Packet(packet) => {
                        let Some(packet) = pre_hooks.pre_batch(packet) else { continue };
                        tracker.observe(&packet);
                        buffer.enqueue(substitute_chunk(
                            &mut cache,
                            &tracker,
                            &chunk_tags,
                            packet,
                        ));
                    }
                    DispatchMsg::Release(conn) => {
                        buffer.enqueue(BatchEntry::ReleaseHeld { conn });
                    }
                    DispatchMsg::Close(conn) => {
                        tracker.forget(conn);
                        buffer.enqueue(BatchEntry::CloseConnection { conn });
                    }
                    DispatchMsg::Open(conn) => {
                        warn!("Unexpected local open for {} on the origin side", conn);
                    }
                }
                if buffer.should_flush_early() {
                    relay::flush_batch(&mut buffer, &pipeline, &link_cmd_tx).await;
                }
            }
            _ = flush_timer.tick() => {
                relay::flush_batch(&mut buffer, &pipeline, &link_cmd_tx).await;
            }
        }
    }
}

/// Replace a full chunk payload the peer already holds with a token.
fn substitute_chunk(
    cache: &mut ChunkCache,
    tracker: &DimensionTracker,
    chunk_tags: &[i32],
    packet: Packet,
) -> BatchEntry {
    if chunk_tags.contains(&packet.tag.0) {
        if let Some(info) = parse_chunk_header(&packet.payload) {
            if info.full {
                let key = ChunkKey {
                    world: tracker.world_for(packet.conn),
                    x: info.x,
                    z: info.z,
                };
                let hash = chunk_hash(&packet.payload);
                if cache.lookup_or_store(key, hash, &packet.payload) == Outcome::Hit {
                    debug!("Chunk ({}, {}) deduplicated for {}", info.x, info.z, packet.conn);
                    return BatchEntry::ChunkRef {
                        conn: packet.conn,
                        tag: packet.tag,
                        token: ChunkToken {
                            world: key.world,
                            x: key.x,
                            z: key.z,
                            hash,
                        },
                    };
                }
            }
        }
    }
    BatchEntry::Data {
        conn: packet.conn,
        tag: packet.tag,
        payload: packet.payload,
    }
}

/// Serverbound delivery: open origin connections, forward client packets.
async fn deliver_loop(
    mut batches_rx: mpsc::Receiver<Vec<BatchEntry>>,
    registry: SinkRegistry,
    mut post_hooks: HookChain,
    dispatch_tx: mpsc::Sender<DispatchMsg>,
    origin_addr: SocketAddr,
) -> Result<()> {
    while let Some(entries) = batches_rx.recv().await {
        for entry in entries {
            match entry {
                BatchEntry::OpenConnection { conn } => {
                    tokio::spawn(connect_origin(
                        origin_addr,
                        conn,
                        registry.clone(),
                        dispatch_tx.clone(),
                    ));
                }
                BatchEntry::Data { conn, tag, payload } => {
                    let packet = Packet::new(conn, Direction::Serverbound, tag, payload);
                    let Some(packet) = post_hooks.post_decompress(packet) else { continue };
                    registry.send_to(conn, packet).await;
                }
                BatchEntry::CloseConnection { conn } => {
                    info!("Edge side closed {}", conn);
                    registry.remove(conn);
                }
                BatchEntry::ChunkRef { conn, .. } => {
                    warn!("Unexpected chunk token for {} on serverbound stream", conn);
                }
                BatchEntry::ReleaseHeld { conn } => {
                    warn!("Unexpected release record for {} on serverbound stream", conn);
                }
            }
        }
    }
    Ok(())
}

/// Dial the origin for one proxied client and pump its clientbound
/// packets into dispatch. The edge holds the client's packets until the
/// release record round-trips, so the origin never sees out-of-session
/// data.
async fn connect_origin(
    origin_addr: SocketAddr,
    conn: ConnectionId,
    registry: SinkRegistry,
    dispatch_tx: mpsc::Sender<DispatchMsg>,
) {
    match TcpStream::connect(origin_addr).await {
        Ok(stream) => {
            info!("Origin connection established for {}", conn);
            stream.set_nodelay(true).ok();
            let (rd, wr) = stream.into_split();
            registry.insert(conn, wr);
            if dispatch_tx.send(DispatchMsg::Release(conn)).await.is_err() {
                return;
            }

            let mut stream = PacketStream::new(rd, conn, Direction::Clientbound);
            loop {
                match stream.next_packet().await {
                    Ok(Some(packet)) => {
                        if dispatch_tx.send(DispatchMsg::Packet(packet)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!("Origin read for {} failed: {:#}", conn, err);
                        break;
                    }
                }
            }
            info!("Origin closed {}", conn);
            registry.remove(conn);
            let _ = dispatch_tx.send(DispatchMsg::Close(conn)).await;
        }
        Err(err) => {
            warn!("Failed to reach origin {} for {}: {}", origin_addr, conn, err);
            let _ = dispatch_tx.send(DispatchMsg::Close(conn)).await;
        }
    }
}
