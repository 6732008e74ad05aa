//! The cache store: memory tier, demotion/promotion, and replacement.
//!
//! All lookups and evictions go through one owner (`&mut self`), which is
//! the serialized access path the delivery task provides. Disk writes are
//! handed to the background writer; their outcomes are drained at the next
//! access, so the critical path never blocks on the filesystem.

use crate::disk::{self, WriteCommand, WriteOutcome};
use anyhow::{Context, Result};
use lru::LruCache;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Cache key: one chunk column in one world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    /// World/dimension identifier.
    pub world: i32,
    /// Chunk x coordinate.
    pub x: i32,
    /// Chunk z coordinate.
    pub z: i32,
}

/// Result of [`ChunkCache::lookup_or_store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The exact payload (same key, same hash) is already cached; the
    /// caller can substitute a token instead of forwarding the bytes.
    Hit,
    /// The payload was stored (fresh key, or replaced a stale version) and
    /// must be forwarded in full.
    Miss,
}

/// Content hash used as the dedup discriminator.
pub fn chunk_hash(payload: &[u8]) -> [u8; 32] {
    *blake3::hash(payload).as_bytes()
}

struct CachedChunk {
    hash: [u8; 32],
    payload: Vec<u8>,
}

/// Two-tier chunk cache. See the crate docs for the tier invariants.
pub struct ChunkCache {
    memory: LruCache<ChunkKey, CachedChunk>,
    mem_bytes: usize,
    budget: usize,
    disk_root: PathBuf,
    /// Keys whose current version lives on disk, with the stored hash.
    disk_index: HashMap<ChunkKey, [u8; 32]>,
    /// Entries evicted from memory whose disk write is still in flight.
    /// They stay resolvable here until the writer confirms.
    demoting: HashMap<ChunkKey, CachedChunk>,
    writer_tx: mpsc::UnboundedSender<WriteCommand>,
    writer_rx: mpsc::UnboundedReceiver<WriteOutcome>,
}

impl ChunkCache {
    /// Open a cache. Creating the disk root is a startup requirement and
    /// fails loudly; per-world directories are created lazily by the
    /// writer.
    pub fn open(memory_budget_bytes: usize, disk_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&disk_path).with_context(|| {
            format!("Failed to create cache directory {}", disk_path.display())
        })?;
        let (writer_tx, writer_rx) = disk::spawn_writer(disk_path.clone());
        Ok(Self {
            memory: LruCache::unbounded(),
            mem_bytes: 0,
            budget: memory_budget_bytes,
            disk_root: disk_path,
            disk_index: HashMap::new(),
            demoting: HashMap::new(),
            writer_tx,
            writer_rx,
        })
    }

    /// Dedup check-and-store for a chunk payload.
    ///
    /// `Hit` means the identical payload is already present (either tier)
    /// and the access refreshed its recency. `Miss` means the payload was
    /// stored, either brand new or replacing a stale version of the same
    /// coordinate (replaced, never merged).
    pub fn lookup_or_store(&mut self, key: ChunkKey, hash: [u8; 32], payload: &[u8]) -> Outcome {
        self.drain_writer();

        if let Some(entry) = self.memory.get(&key) {
            if entry.hash == hash {
                return Outcome::Hit;
            }
            // Stale version: replace in place.
            debug!("Replacing stale chunk {:?} in memory tier", key);
            self.insert_memory(key, hash, payload.to_vec());
            return Outcome::Miss;
        }

        if let Some(staged_hash) = self.demoting.get(&key).map(|staged| staged.hash) {
            if staged_hash == hash {
                return Outcome::Hit;
            }
            // Superseded while its demotion is in flight; the pending file
            // will be overwritten or removed when the outcome drains.
            self.demoting.remove(&key);
            self.insert_memory(key, hash, payload.to_vec());
            return Outcome::Miss;
        }

        if let Some(&disk_hash) = self.disk_index.get(&key) {
            if disk_hash == hash {
                return match self.promote(key, hash) {
                    Some(_) => Outcome::Hit,
                    None => {
                        // Unreadable file; fall through to a fresh store.
                        self.insert_memory(key, hash, payload.to_vec());
                        Outcome::Miss
                    }
                };
            }
            // Stale on disk: replace with the new version in memory.
            self.disk_index.remove(&key);
            let _ = self.writer_tx.send(WriteCommand::Remove { key });
            self.insert_memory(key, hash, payload.to_vec());
            return Outcome::Miss;
        }

        self.insert_memory(key, hash, payload.to_vec());
        Outcome::Miss
    }

    /// Resolve a substitution token against the cache.
    ///
    /// Returns the payload when the exact version is present; a disk hit
    /// promotes the entry back to the memory tier.
    pub fn resolve(&mut self, key: ChunkKey, hash: [u8; 32]) -> Option<Vec<u8>> {
        self.drain_writer();

        if let Some(entry) = self.memory.get(&key) {
            if entry.hash == hash {
                return Some(entry.payload.clone());
            }
            return None;
        }

        if let Some(staged) = self.demoting.get(&key) {
            if staged.hash == hash {
                return Some(staged.payload.clone());
            }
            return None;
        }

        if self.disk_index.get(&key) == Some(&hash) {
            return self.promote(key, hash);
        }
        None
    }

    /// Wait until no demotion writes are in flight. Used by tests and
    /// shutdown; the forwarding path never calls this.
    pub async fn settle(&mut self) {
        while !self.demoting.is_empty() {
            match self.writer_rx.recv().await {
                Some(outcome) => self.apply_outcome(outcome),
                None => break,
            }
        }
    }

    /// Entries resident in the memory tier (staged demotions included).
    pub fn memory_len(&self) -> usize {
        self.memory.len() + self.demoting.len()
    }

    /// Entries resident in the disk tier.
    pub fn disk_len(&self) -> usize {
        self.disk_index.len()
    }

    /// Bytes held by the memory tier proper.
    pub fn memory_bytes(&self) -> usize {
        self.mem_bytes
    }

    fn insert_memory(&mut self, key: ChunkKey, hash: [u8; 32], payload: Vec<u8>) {
        self.mem_bytes += payload.len();
        if let Some(old) = self.memory.put(key, CachedChunk { hash, payload }) {
            self.mem_bytes -= old.payload.len();
        }
        self.evict_over_budget();
    }

    /// Demote least-recently-used entries until the byte budget holds.
    fn evict_over_budget(&mut self) {
        while self.mem_bytes > self.budget {
            let Some((key, chunk)) = self.memory.pop_lru() else {
                break;
            };
            self.mem_bytes -= chunk.payload.len();
            let send = self.writer_tx.send(WriteCommand::Store {
                key,
                hash: chunk.hash,
                payload: chunk.payload.clone(),
            });
            if send.is_ok() {
                self.demoting.insert(key, chunk);
            } else {
                warn!("Disk writer is gone; evicted chunk {:?} is lost", key);
            }
        }
    }

    /// Read a disk entry back into the memory tier.
    fn promote(&mut self, key: ChunkKey, hash: [u8; 32]) -> Option<Vec<u8>> {
        match disk::read_entry(&self.disk_root, key, hash) {
            Ok(payload) => {
                self.disk_index.remove(&key);
                let _ = self.writer_tx.send(WriteCommand::Remove { key });
                let out = payload.clone();
                self.insert_memory(key, hash, payload);
                debug!("Promoted chunk {:?} back to memory tier", key);
                Some(out)
            }
            Err(err) => {
                warn!("Failed to promote chunk {:?}: {:#}", key, err);
                self.disk_index.remove(&key);
                let _ = self.writer_tx.send(WriteCommand::Remove { key });
                None
            }
        }
    }

    fn drain_writer(&mut self) {
        while let Ok(outcome) = self.writer_rx.try_recv() {
            self.apply_outcome(outcome);
        }
    }

    fn apply_outcome(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Stored { key, hash } => {
                match self.demoting.get(&key).map(|staged| staged.hash) {
                    Some(staged_hash) if staged_hash == hash => {
                        self.demoting.remove(&key);
                        self.disk_index.insert(key, hash);
                    }
                    Some(_) => {
                        // A newer demotion for this key is queued and will
                        // overwrite the file; nothing to do.
                    }
                    None => {
                        // The entry was replaced while the write was in
                        // flight; the file on disk is stale.
                        let _ = self.writer_tx.send(WriteCommand::Remove { key });
                    }
                }
            }
            WriteOutcome::Failed { key, hash } => {
                if let Some(staged) = self.demoting.remove(&key) {
                    if staged.hash == hash {
                        // Degrade to memory-tier-only rather than losing
                        // data that was already transferred once. This may
                        // leave the tier over budget until pressure eases.
                        warn!(
                            "Chunk {:?} degraded to memory-only after disk failure",
                            key
                        );
                        self.mem_bytes += staged.payload.len();
                        self.memory.put(key, staged);
                    } else {
                        self.demoting.insert(key, staged);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(x: i32, z: i32) -> ChunkKey {
        ChunkKey { world: 0, x, z }
    }

    fn payload(byte: u8, len: usize) -> Vec<u8> {
        vec![byte; len]
    }

    fn open_cache(budget: usize) -> (ChunkCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let cache = ChunkCache::open(budget, dir.path().join("chunks")).expect("Failed to open");
        (cache, dir)
    }

    #[tokio::test]
    async fn test_store_then_identical_store_is_hit() {
        let (mut cache, _dir) = open_cache(1 << 20);
        let data = payload(1, 64);
        let hash = chunk_hash(&data);

        assert_eq!(cache.lookup_or_store(key(0, 0), hash, &data), Outcome::Miss);
        assert_eq!(cache.lookup_or_store(key(0, 0), hash, &data), Outcome::Hit);
        assert_eq!(cache.memory_len(), 1);
    }

    #[tokio::test]
    async fn test_new_hash_replaces_old_entry() {
        let (mut cache, _dir) = open_cache(1 << 20);
        let old = payload(1, 64);
        let new = payload(2, 64);
        let old_hash = chunk_hash(&old);
        let new_hash = chunk_hash(&new);

        cache.lookup_or_store(key(10, -3), old_hash, &old);
        assert_eq!(
            cache.lookup_or_store(key(10, -3), new_hash, &new),
            Outcome::Miss
        );

        // Replaced, not retained alongside.
        assert_eq!(cache.memory_len(), 1);
        assert!(cache.resolve(key(10, -3), old_hash).is_none());
        assert_eq!(cache.resolve(key(10, -3), new_hash), Some(new));
    }

    #[tokio::test]
    async fn test_lru_entry_demotes_to_disk_under_pressure() {
        // Budget fits two entries; the third insert demotes the least
        // recently used.
        let (mut cache, _dir) = open_cache(128);
        let a = payload(1, 64);
        let b = payload(2, 64);
        let c = payload(3, 64);

        cache.lookup_or_store(key(0, 0), chunk_hash(&a), &a);
        cache.lookup_or_store(key(1, 0), chunk_hash(&b), &b);
        // Touch A so B becomes least-recently-used.
        assert_eq!(cache.resolve(key(0, 0), chunk_hash(&a)), Some(a.clone()));

        cache.lookup_or_store(key(2, 0), chunk_hash(&c), &c);
        cache.settle().await;

        assert_eq!(cache.disk_len(), 1);
        assert_eq!(cache.memory_bytes(), 128);
        // B went to disk, A stayed resident.
        assert!(cache.memory.contains(&key(0, 0)));
        assert!(!cache.memory.contains(&key(1, 0)));
        assert_eq!(cache.disk_index.get(&key(1, 0)), Some(&chunk_hash(&b)));
    }

    #[tokio::test]
    async fn test_disk_hit_promotes_back_to_memory() {
        let (mut cache, _dir) = open_cache(128);
        let a = payload(1, 64);
        let b = payload(2, 64);
        let c = payload(3, 64);

        cache.lookup_or_store(key(0, 0), chunk_hash(&a), &a);
        cache.lookup_or_store(key(1, 0), chunk_hash(&b), &b);
        cache.lookup_or_store(key(2, 0), chunk_hash(&c), &c);
        cache.settle().await;
        assert_eq!(cache.disk_len(), 1);

        // A was demoted (least recently used). Resolving it reads the
        // disk tier and moves it back; some other entry demotes instead.
        let resolved = cache.resolve(key(0, 0), chunk_hash(&a));
        assert_eq!(resolved, Some(a));
        assert!(cache.memory.contains(&key(0, 0)));
        assert!(!cache.disk_index.contains_key(&key(0, 0)));
    }

    #[tokio::test]
    async fn test_identical_payload_after_demotion_is_still_a_hit() {
        let (mut cache, _dir) = open_cache(64);
        let a = payload(1, 64);
        let b = payload(2, 64);

        cache.lookup_or_store(key(0, 0), chunk_hash(&a), &a);
        // Second insert pushes A out of the memory budget.
        cache.lookup_or_store(key(1, 0), chunk_hash(&b), &b);
        cache.settle().await;
        assert_eq!(cache.disk_len(), 1);

        // Re-sending A is still deduplicated via the disk tier.
        assert_eq!(
            cache.lookup_or_store(key(0, 0), chunk_hash(&a), &a),
            Outcome::Hit
        );
    }

    #[tokio::test]
    async fn test_resolve_unknown_token_misses() {
        let (mut cache, _dir) = open_cache(1 << 20);
        assert!(cache.resolve(key(5, 5), chunk_hash(b"never stored")).is_none());
    }

    #[tokio::test]
    async fn test_disk_write_failure_degrades_to_memory_only() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = dir.path().join("chunks");
        let mut cache = ChunkCache::open(64, root.clone()).expect("Failed to open");

        // Occupy the world directory path with a plain file so the
        // writer's create_dir_all fails.
        std::fs::write(root.join("world_0"), b"not a directory").expect("Failed to plant file");

        let a = payload(1, 64);
        let b = payload(2, 64);
        cache.lookup_or_store(key(0, 0), chunk_hash(&a), &a);
        cache.lookup_or_store(key(1, 0), chunk_hash(&b), &b);
        cache.settle().await;

        // Demotion failed; the entry is still resolvable from memory and
        // forwarding never failed.
        assert_eq!(cache.disk_len(), 0);
        assert_eq!(cache.resolve(key(0, 0), chunk_hash(&a)), Some(a));
    }

    #[test]
    fn test_open_fails_on_unusable_root() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file_path = dir.path().join("occupied");
        std::fs::write(&file_path, b"file").expect("Failed to write");

        // Runtime-free construction is fine up to the writer spawn, which
        // is why this test builds a runtime only to prove the failure
        // happens before it matters.
        let runtime = tokio::runtime::Runtime::new().expect("Failed to build runtime");
        let _guard = runtime.enter();
        assert!(ChunkCache::open(64, file_path).is_err());
    }
}
