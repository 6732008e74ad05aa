#![warn(missing_docs)]
//! Proxy role assemblies: packet ingress/egress adapters around live game
//! connections, and the external (edge) and internal (origin-side) proxy
//! processes built on the inter-proxy transport.

mod adapter;
mod chunk;
mod external;
mod internal;
mod registry;
mod relay;

pub use adapter::{PacketSink, PacketStream, MAX_GAME_FRAME_LEN};
pub use chunk::{parse_chunk_header, ChunkHeaderInfo, DimensionTracker};
pub use external::ExternalProxy;
pub use internal::InternalProxy;
