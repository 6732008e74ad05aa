//! External (edge) proxy: accepts game clients, batches their traffic over
//! the link, and replays the origin's traffic back to them.
//!
//! Client packets are held until the internal proxy confirms the origin
//! connection is up (a `ReleaseHeld` record on the clientbound stream), so
//! the origin never sees data for a connection it has not opened.

use crate::adapter::PacketStream;
use crate::chunk::{parse_chunk_header, DimensionTracker};
use crate::registry::SinkRegistry;
use crate::relay::{self, DispatchMsg};
use anyhow::{Context, Result};
use mclink_cache::{chunk_hash, ChunkCache, ChunkKey};
use mclink_core::{Config, ConnectionId, Direction, HookChain, Packet};
use mclink_net::{
    spawn_pipeline, BatchBuffer, BatchEntry, LinkDriver, LinkEndpoint, LinkId, PipelineHandle,
    SenderCmd,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// The edge's single inter-proxy link.
const LINK: LinkId = LinkId(0);

/// The client-facing proxy process.
pub struct ExternalProxy {
    config: Config,
    game_listener: TcpListener,
    link_peer: SocketAddr,
}

impl ExternalProxy {
    /// Resolve addresses and bind the game listener. Any failure here is a
    /// startup misconfiguration and is surfaced immediately.
    pub async fn bind(config: Config) -> Result<Self> {
        let game_addr = Config::resolve_addr(&config.game_bind)?;
        let link_peer = Config::resolve_addr(&config.link_peer)?;
        let game_listener = TcpListener::bind(game_addr)
            .await
            .with_context(|| format!("Failed to bind game listener on {game_addr}"))?;
        info!(
            "External proxy listening for game clients on {}",
            game_listener.local_addr()?
        );
        Ok(Self {
            config,
            game_listener,
            link_peer,
        })
    }

    /// Address game clients should connect to.
    pub fn game_addr(&self) -> Result<SocketAddr> {
        self.game_listener
            .local_addr()
            .context("Game listener has no local address")
    }

    /// Run until shutdown. `pre_hooks` runs per packet before batching;
    /// `post_hooks` runs per delivered packet before cache processing.
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

        let driver = LinkDriver::new(
            LinkEndpoint::dial(self.link_peer, &config.reconnect_backoff),
            config.send_buffer_ceiling_bytes,
        );
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

        tokio::spawn(accept_clients(
            self.game_listener,
            registry.clone(),
            dispatch_tx.clone(),
        ));
        tokio::spawn(run_dispatch(
            Duration::from_millis(config.flush_interval_ms),
            config.flush_size_threshold_bytes,
            dispatch_rx,
            pre_hooks,
            pipeline,
            link_cmd_tx,
        ));

        let tracker = DimensionTracker::new(config.join_game_tag, config.respawn_tag);
        deliver_loop(
            batches_rx,
            registry,
            cache,
            post_hooks,
            dispatch_tx,
            config.chunk_tags,
            tracker,
        )
        .await
    }
}

/// Accept game clients, assign connection ids, and spawn per-client
/// reader tasks.
async fn accept_clients(
    listener: TcpListener,
    registry: SinkRegistry,
    dispatch_tx: mpsc::Sender<DispatchMsg>,
) {
    let mut next_conn = 1u64;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn = ConnectionId(next_conn);
                next_conn += 1;
                info!("Game client {} connected as {}", peer, conn);
                stream.set_nodelay(true).ok();
                let (rd, wr) = stream.into_split();
                registry.insert(conn, wr);
                if dispatch_tx.send(DispatchMsg::Open(conn)).await.is_err() {
                    return;
                }

                let dispatch_tx = dispatch_tx.clone();
                let registry = registry.clone();
                tokio::spawn(async move {
                    let mut stream = PacketStream::new(rd, conn, Direction::Serverbound);
                    loop {
                        match stream.next_packet().await {
                            Ok(Some(packet)) => {
                                if dispatch_tx
                                    .send(DispatchMsg::Packet(packet))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                debug!("Read from {} failed: {:#}", conn, err);
                                break;
                            }
                        }
                    }
                    info!("Game client {} disconnected", conn);
                    registry.remove(conn);
                    let _ = dispatch_tx.send(DispatchMsg::Close(conn)).await;
                });
            }
            Err(err) => {
                warn!("Game accept failed: {}", err);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Serverbound dispatch: hooks, held-until-released queues, batching.
async fn run_dispatch(
    flush_interval: Duration,
    flush_threshold: usize,
    mut dispatch_rx: mpsc::Receiver<DispatchMsg>,
    mut pre_hooks: HookChain,
    pipeline: PipelineHandle,
    link_cmd_tx: mpsc::Sender<SenderCmd>,
) {
    let mut buffer = BatchBuffer::new(LINK, flush_threshold);
    let mut held: HashMap<ConnectionId, Vec<Packet>> = HashMap::new();
    let mut flush_timer = tokio::time::interval(flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = dispatch_rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    DispatchMsg::Open(conn) => {
                        held.insert(conn, Vec::new());
                        buffer.enqueue(BatchEntry::OpenConnection { conn });
                    }
                    DispatchMsg::Packet(packet) => {
                        // Hooks see packets at arrival, in arrival order,
                        // even when the result is held back.
                        let Some(packet) = pre_hooks.pre_batch(packet) else { continue };
                        if let Some(queue) = held.get_mut(&packet.conn) {
                            queue.push(packet);
                        } else {
                            buffer.enqueue(BatchEntry::Data {
                                conn: packet.conn,
                                tag: packet.tag,
                                payload: packet.payload,
                            });
                        }
                    }
                    DispatchMsg::Release(conn) => {
                        if let Some(queue) = held.remove(&conn) {
                            debug!("Releasing {} held packets for {}", queue.len(), conn);
                            for packet in queue {
                                buffer.enqueue(BatchEntry::Data {
                                    conn: packet.conn,
                                    tag: packet.tag,
                                    payload: packet.payload,
                                });
                            }
                        }
                    }
                    DispatchMsg::Close(conn) => {
                        held.remove(&conn);
                        buffer.enqueue(BatchEntry::CloseConnection { conn });
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

/// Clientbound delivery: hooks, chunk cache, egress to game clients.
async fn deliver_loop(
    mut batches_rx: mpsc::Receiver<Vec<BatchEntry>>,
    registry: SinkRegistry,
    mut cache: ChunkCache,
    mut post_hooks: HookChain,
    dispatch_tx: mpsc::Sender<DispatchMsg>,
    chunk_tags: Vec<i32>,
    mut tracker: DimensionTracker,
) -> Result<()> {
    while let Some(entries) = batches_rx.recv().await {
        for entry in entries {
            match entry {
                BatchEntry::Data { conn, tag, payload } => {
                    let packet = Packet::new(conn, Direction::Clientbound, tag, payload);
                    let Some(packet) = post_hooks.post_decompress(packet) else { continue };
                    tracker.observe(&packet);

                    // Mirror full chunk payloads so later sends can arrive
                    // as tokens.
                    if chunk_tags.contains(&tag.0) {
                        if let Some(info) = parse_chunk_header(&packet.payload) {
                            if info.full {
                                let key = ChunkKey {
                                    world: tracker.world_for(conn),
                                    x: info.x,
                                    z: info.z,
                                };
                                cache.lookup_or_store(
                                    key,
                                    chunk_hash(&packet.payload),
                                    &packet.payload,
                                );
                            }
                        }
                    }
                    registry.send_to(conn, packet).await;
                }
                BatchEntry::ChunkRef { conn, tag, token } => {
                    let key = ChunkKey {
                        world: token.world,
                        x: token.x,
                        z: token.z,
                    };
                    match cache.resolve(key, token.hash) {
                        Some(payload) => {
                            let packet =
                                Packet::new(conn, Direction::Clientbound, tag, payload);
                            let Some(packet) = post_hooks.post_decompress(packet) else {
                                continue;
                            };
                            registry.send_to(conn, packet).await;
                        }
                        None => {
                            // Cold cache after a restart; the next full
                            // send repopulates both sides.
                            warn!("Unresolvable chunk token {:?}; dropping packet", key);
                        }
                    }
                }
                BatchEntry::ReleaseHeld { conn } => {
                    if dispatch_tx.send(DispatchMsg::Release(conn)).await.is_err() {
                        anyhow::bail!("Dispatch task is gone");
                    }
                }
                BatchEntry::CloseConnection { conn } => {
                    info!("Origin side closed {}", conn);
                    tracker.forget(conn);
                    registry.remove(conn);
                }
                BatchEntry::OpenConnection { conn } => {
                    warn!("Unexpected open record for {} on clientbound stream", conn);
                }
            }
        }
    }
    Ok(())
}
