#![warn(missing_docs)]
//! Two-tier content-addressed chunk cache.
//!
//! Chunk payloads are keyed by `(world, x, z)` and validated by blake3
//! content hash. The bounded memory tier evicts least-recently-used entries
//! by demoting them to an unbounded disk tier; a disk hit promotes the
//! entry back. For a given key at most one entry exists across both tiers.

mod disk;
mod store;

pub use store::{chunk_hash, ChunkCache, ChunkKey, Outcome};
