//! Configuration surface for both proxy roles.
//!
//! Loaded from a TOML file; every field has a default so a minimal config
//! only needs `role`. Misconfiguration is surfaced loudly at startup, it is
//! never retried.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

/// Which half of the proxy pair this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Runs next to the origin server; listens for the external proxy.
    Internal,
    /// Runs at the edge; accepts game clients and dials the internal proxy.
    External,
}

/// Exponential backoff parameters for link reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First retry delay in milliseconds.
    #[serde(default = "default_backoff_initial")]
    pub initial_ms: u64,
    /// Ceiling for the retry delay in milliseconds.
    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,
    /// Multiplier applied after each failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial(),
            max_ms: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

/// Chunk cache sizing and placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget for the in-memory tier before entries demote to disk.
    #[serde(default = "default_cache_budget")]
    pub memory_budget_bytes: usize,
    /// Root directory for the disk tier.
    #[serde(default = "default_cache_path")]
    pub disk_path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: default_cache_budget(),
            disk_path: default_cache_path(),
        }
    }
}

/// Full configuration for one proxy process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Proxy role.
    pub role: Role,

    /// Flush window for the batching buffer, in milliseconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Pending raw bytes that force an early flush.
    #[serde(default = "default_flush_threshold")]
    pub flush_size_threshold_bytes: usize,

    /// Number of compression worker slots.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Address the internal proxy listens on for the link.
    #[serde(default = "default_link_bind")]
    pub link_bind: String,

    /// Address the external proxy dials to reach the internal proxy.
    #[serde(default = "default_link_peer")]
    pub link_peer: String,

    /// Address the external proxy listens on for game clients.
    #[serde(default = "default_game_bind")]
    pub game_bind: String,

    /// Address of the real game server, used by the internal proxy.
    #[serde(default = "default_origin_addr")]
    pub origin_addr: String,

    /// Byte ceiling for unconfirmed frames retained for retransmission.
    #[serde(default = "default_send_ceiling")]
    pub send_buffer_ceiling_bytes: usize,

    /// Enables debug-level logging when no RUST_LOG override is set.
    #[serde(default)]
    pub debug: bool,

    /// Packet-id tags treated as chunk data (cache eligible).
    #[serde(default = "default_chunk_tags")]
    pub chunk_tags: Vec<i32>,

    /// Packet-id tag of the join-game packet (dimension capture).
    #[serde(default = "default_join_game_tag")]
    pub join_game_tag: i32,

    /// Packet-id tag of the respawn packet (dimension capture).
    #[serde(default = "default_respawn_tag")]
    pub respawn_tag: i32,

    /// Link reconnection backoff.
    #[serde(default)]
    pub reconnect_backoff: BackoffConfig,

    /// Chunk cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_flush_interval() -> u64 {
    50
}
fn default_flush_threshold() -> usize {
    256 * 1024
}
fn default_worker_count() -> usize {
    4
}
fn default_link_bind() -> String {
    "0.0.0.0:41429".to_string()
}
fn default_link_peer() -> String {
    "127.0.0.1:41429".to_string()
}
fn default_game_bind() -> String {
    "0.0.0.0:25565".to_string()
}
fn default_origin_addr() -> String {
    "127.0.0.1:25566".to_string()
}
fn default_send_ceiling() -> usize {
    8 * 1024 * 1024
}
fn default_chunk_tags() -> Vec<i32> {
    // Chunk data packet id for protocol 498.
    vec![0x21]
}
fn default_join_game_tag() -> i32 {
    0x25
}
fn default_respawn_tag() -> i32 {
    0x3A
}
fn default_backoff_initial() -> u64 {
    500
}
fn default_backoff_max() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_cache_budget() -> usize {
    64 * 1024 * 1024
}
fn default_cache_path() -> PathBuf {
    PathBuf::from("/var/cache/mclink")
}

impl Config {
    /// Load and validate a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that would otherwise fail deep inside the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be at least 1");
        }
        if self.flush_interval_ms == 0 {
            anyhow::bail!("flush_interval_ms must be at least 1");
        }
        if self.reconnect_backoff.multiplier < 1.0 {
            anyhow::bail!(
                "reconnect_backoff.multiplier must be >= 1.0, got {}",
                self.reconnect_backoff.multiplier
            );
        }
        if self.cache.memory_budget_bytes == 0 {
            anyhow::bail!("cache.memory_budget_bytes must be non-zero");
        }
        Ok(())
    }

    /// Resolve a configured address string, failing loudly on bad input.
    pub fn resolve_addr(addr: &str) -> Result<SocketAddr> {
        addr.to_socket_addrs()
            .with_context(|| format!("Failed to resolve address {addr:?}"))?
            .next()
            .with_context(|| format!("Address {addr:?} resolved to nothing"))
    }
}
