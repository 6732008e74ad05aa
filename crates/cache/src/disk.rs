//! Disk tier: one file per chunk coordinate with a validated header.
//!
//! Writes run on a background task so they never stall the delivery path;
//! outcomes flow back so the store can either index the entry or degrade
//! it to memory-tier-only on failure.

use crate::store::ChunkKey;
use anyhow::{Context, Result};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Magic number for cache file identification ("MCKC" = mclink chunk).
const CACHE_MAGIC: u32 = 0x4D434B43;

/// Current cache file format version.
const CACHE_VERSION: u16 = 1;

/// Fixed header in front of every cached payload.
struct FileHeader {
    magic: u32,
    version: u16,
    crc32: u32,
    hash: [u8; 32],
    payload_len: u32,
}

impl FileHeader {
    const LEN: usize = 4 + 2 + 4 + 32 + 4;

    fn new(crc32: u32, hash: [u8; 32], payload_len: u32) -> Self {
        Self {
            magic: CACHE_MAGIC,
            version: CACHE_VERSION,
            crc32,
            hash,
            payload_len,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::LEN);
        bytes.extend_from_slice(&self.magic.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.crc32.to_le_bytes());
        bytes.extend_from_slice(&self.hash);
        bytes.extend_from_slice(&self.payload_len.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN {
            anyhow::bail!("Cache file header too short");
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != CACHE_MAGIC {
            anyhow::bail!(
                "Invalid cache file magic: expected 0x{:08X}, got 0x{:08X}",
                CACHE_MAGIC,
                magic
            );
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != CACHE_VERSION {
            anyhow::bail!("Unsupported cache file version: {}", version);
        }
        let crc32 = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let hash: [u8; 32] = bytes[10..42].try_into().expect("slice is 32 bytes");
        let payload_len = u32::from_le_bytes([bytes[42], bytes[43], bytes[44], bytes[45]]);
        Ok(Self {
            magic,
            version,
            crc32,
            hash,
            payload_len,
        })
    }
}

fn chunk_path(root: &Path, key: ChunkKey) -> PathBuf {
    root.join(format!("world_{}", key.world))
        .join(format!("c.{}.{}.mcc", key.x, key.z))
}

fn crc_of(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Write one entry, creating the world directory as needed.
fn write_entry(root: &Path, key: ChunkKey, hash: [u8; 32], payload: &[u8]) -> Result<()> {
    let path = chunk_path(root, key);
    let dir = path.parent().expect("chunk path always has a parent");
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;

    let header = FileHeader::new(crc_of(payload), hash, payload.len() as u32);
    let mut file = fs::File::create(&path)
        .with_context(|| format!("Failed to create cache file {}", path.display()))?;
    file.write_all(&header.to_bytes())
        .and_then(|_| file.write_all(payload))
        .with_context(|| format!("Failed to write cache file {}", path.display()))?;
    Ok(())
}

/// Read and validate one entry.
pub(crate) fn read_entry(root: &Path, key: ChunkKey, expected_hash: [u8; 32]) -> Result<Vec<u8>> {
    let path = chunk_path(root, key);
    let mut file = fs::File::open(&path)
        .with_context(|| format!("Failed to open cache file {}", path.display()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .with_context(|| format!("Failed to read cache file {}", path.display()))?;

    let header = FileHeader::from_bytes(&bytes)?;
    let payload = &bytes[FileHeader::LEN..];
    if payload.len() != header.payload_len as usize {
        anyhow::bail!(
            "Cache file {} truncated: header says {} bytes, found {}",
            path.display(),
            header.payload_len,
            payload.len()
        );
    }
    if crc_of(payload) != header.crc32 {
        anyhow::bail!("Cache file {} failed CRC validation", path.display());
    }
    if header.hash != expected_hash {
        anyhow::bail!("Cache file {} holds a different chunk version", path.display());
    }
    Ok(payload.to_vec())
}

fn remove_entry(root: &Path, key: ChunkKey) {
    let path = chunk_path(root, key);
    if let Err(err) = fs::remove_file(&path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove cache file {}: {}", path.display(), err);
        }
    }
}

pub(crate) enum WriteCommand {
    Store {
        key: ChunkKey,
        hash: [u8; 32],
        payload: Vec<u8>,
    },
    Remove {
        key: ChunkKey,
    },
}

pub(crate) enum WriteOutcome {
    Stored { key: ChunkKey, hash: [u8; 32] },
    /// The store keeps the staged payload until a `Stored` confirmation,
    /// so a failure only needs to identify the entry to reinstate.
    Failed { key: ChunkKey, hash: [u8; 32] },
}

/// Spawn the background writer for a cache root.
pub(crate) fn spawn_writer(
    root: PathBuf,
) -> (
    mpsc::UnboundedSender<WriteCommand>,
    mpsc::UnboundedReceiver<WriteOutcome>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<WriteCommand>();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel::<WriteOutcome>();

    tokio::spawn(async move {
        while let Some(command) = cmd_rx.recv().await {
            match command {
                WriteCommand::Store { key, hash, payload } => {
                    let root = root.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        write_entry(&root, key, hash, &payload)
                    })
                    .await;
                    let outcome = match result {
                        Ok(Ok(())) => {
                            debug!("Demoted chunk {:?} to disk tier", key);
                            WriteOutcome::Stored { key, hash }
                        }
                        Ok(Err(err)) => {
                            warn!("Disk write for chunk {:?} failed: {:#}", key, err);
                            WriteOutcome::Failed { key, hash }
                        }
                        Err(join_err) => {
                            warn!("Disk writer task panicked: {}", join_err);
                            WriteOutcome::Failed { key, hash }
                        }
                    };
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                }
                WriteCommand::Remove { key } => {
                    let root = root.clone();
                    let _ = tokio::task::spawn_blocking(move || remove_entry(&root, key)).await;
                }
            }
        }
    });

    (cmd_tx, outcome_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ChunkKey {
        ChunkKey {
            world: 0,
            x: 3,
            z: -7,
        }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let payload = vec![5u8; 128];
        let hash = *blake3::hash(&payload).as_bytes();

        write_entry(dir.path(), key(), hash, &payload).expect("Failed to write");
        let read = read_entry(dir.path(), key(), hash).expect("Failed to read");
        assert_eq!(read, payload);
    }

    #[test]
    fn test_read_rejects_corrupted_payload() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let payload = vec![5u8; 128];
        let hash = *blake3::hash(&payload).as_bytes();
        write_entry(dir.path(), key(), hash, &payload).expect("Failed to write");

        // Flip a payload byte on disk.
        let path = chunk_path(dir.path(), key());
        let mut bytes = fs::read(&path).expect("Failed to read file");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).expect("Failed to write file");

        let result = read_entry(dir.path(), key(), hash);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("CRC"));
    }

    #[test]
    fn test_read_rejects_wrong_version_hash() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let payload = vec![5u8; 16];
        let hash = *blake3::hash(&payload).as_bytes();
        write_entry(dir.path(), key(), hash, &payload).expect("Failed to write");

        let other_hash = *blake3::hash(b"different").as_bytes();
        assert!(read_entry(dir.path(), key(), other_hash).is_err());
    }

    #[test]
    fn test_remove_missing_file_is_silent() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        remove_entry(dir.path(), key());
    }
}
