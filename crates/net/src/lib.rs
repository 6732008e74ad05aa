#![warn(missing_docs)]
//! Inter-proxy transport: batching, parallel compression, and the framed,
//! strictly-ordered link protocol between the two proxy processes.

mod batch;
mod driver;
mod frame;
mod link;
mod pipeline;
mod transport;

pub use batch::{decode_entries, encode_entries, Batch, BatchBuffer, BatchEntry, ChunkToken, LinkId};
pub use driver::{LinkDriver, SenderCmd};
pub use frame::{Frame, FrameError, FrameFlag, HEADER_LEN, MAX_FRAME_LEN};
pub use link::{HandshakeBody, Inbox, Outbox, MAX_GAPS_BEFORE_RESYNC};
pub use pipeline::{
    spawn_pipeline, Job, JobKind, PipelineEvent, PipelineHandle, WorkerId, MAX_COMPRESS_ATTEMPTS,
};
pub use transport::{read_frame, write_frame, LinkEndpoint, ReadOutcome, ReconnectBackoff};
