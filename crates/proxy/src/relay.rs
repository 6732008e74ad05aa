//! Glue tasks shared by both proxy roles: routing pipeline completions to
//! the link sender, and feeding received frames back through the pipeline
//! for decompression.

use mclink_core::{ConnectionId, Packet};
use mclink_net::{
    decode_entries, encode_entries, BatchBuffer, BatchEntry, Inbox, Job, JobKind, LinkId,
    PipelineEvent, PipelineHandle, SenderCmd,
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Events feeding a direction's dispatch task.
pub(crate) enum DispatchMsg {
    /// A new game client connected at the edge.
    Open(ConnectionId),
    /// An ingress packet in arrival order.
    Packet(Packet),
    /// The local half of a proxied connection went away.
    Close(ConnectionId),
    /// The connection is ready on the far side; release held packets
    /// (edge) or announce readiness (origin side).
    Release(ConnectionId),
}

/// Flush the buffer, if non-empty, into a compression job.
///
/// Sequence numbers are allocated by the flush; if the entries cannot be
/// serialized the sequence is surfaced as a permanent failure so the
/// outbox never waits on a hole.
pub(crate) async fn flush_batch(
    buffer: &mut BatchBuffer,
    pipeline: &PipelineHandle,
    link_cmd_tx: &mpsc::Sender<SenderCmd>,
) {
    let Some(batch) = buffer.flush() else { return };
    match encode_entries(&batch.entries) {
        Ok(data) => {
            let job = Job {
                link: batch.link,
                sequence: batch.sequence,
                kind: JobKind::Compress,
                data,
            };
            if pipeline.submit(job).await.is_err() {
                error!("Compression pipeline is gone; batch {} lost", batch.sequence);
            }
        }
        Err(err) => {
            error!(
                "Failed to serialize batch {}: {:#}; recording gap",
                batch.sequence, err
            );
            let _ = link_cmd_tx
                .send(SenderCmd::Fail {
                    sequence: batch.sequence,
                })
                .await;
        }
    }
}

/// Submit received compressed frames as decompression jobs.
///
/// The link delivers frames in sequence order but with holes where gap
/// markers advanced the cursor, so jobs are renumbered with a dense local
/// ticket; the router reorders completions by ticket and never waits on a
/// hole.
pub(crate) async fn feed_decompression(
    link: LinkId,
    mut deliver_rx: mpsc::Receiver<(u64, Vec<u8>)>,
    pipeline: PipelineHandle,
) {
    let mut ticket = 0u64;
    while let Some((link_sequence, payload)) = deliver_rx.recv().await {
        ticket += 1;
        debug!(
            "Queueing batch seq {} for decompression (ticket {})",
            link_sequence, ticket
        );
        let job = Job {
            link,
            sequence: ticket,
            kind: JobKind::Decompress,
            data: payload,
        };
        if pipeline.submit(job).await.is_err() {
            break;
        }
    }
    // The link is gone; anything still in flight for it is garbage.
    let _ = pipeline.cancel(link).await;
}

/// Route pipeline completions: compressed batches to the link sender (in
/// completion order; the outbox restores sequence order), decompressed
/// batches through a reorder stage and out as decoded entry lists.
pub(crate) async fn route_pipeline_events(
    mut events_rx: mpsc::Receiver<PipelineEvent>,
    link_cmd_tx: mpsc::Sender<SenderCmd>,
    batches_tx: mpsc::Sender<Vec<BatchEntry>>,
) {
    let mut reorder = Inbox::new();
    while let Some(event) = events_rx.recv().await {
        match event {
            PipelineEvent::Complete {
                kind: JobKind::Compress,
                sequence,
                data,
                ..
            } => {
                if link_cmd_tx
                    .send(SenderCmd::Offer {
                        sequence,
                        payload: data,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            PipelineEvent::Failed {
                kind: JobKind::Compress,
                sequence,
                ..
            } => {
                warn!(
                    "Batch seq {} failed compression permanently; peer gets a gap marker",
                    sequence
                );
                if link_cmd_tx.send(SenderCmd::Fail { sequence }).await.is_err() {
                    break;
                }
            }
            PipelineEvent::Complete {
                kind: JobKind::Decompress,
                sequence,
                data,
                ..
            } => {
                for (_, payload) in reorder.accept(sequence, data) {
                    match decode_entries(&payload) {
                        Ok(entries) => {
                            if batches_tx.send(entries).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!("Dropping undecodable batch: {:#}", err);
                        }
                    }
                }
            }
            PipelineEvent::Failed {
                kind: JobKind::Decompress,
                sequence,
                ..
            } => {
                warn!("Dropping batch that failed decompression (ticket {})", sequence);
                for (_, payload) in reorder.gap(sequence) {
                    match decode_entries(&payload) {
                        Ok(entries) => {
                            if batches_tx.send(entries).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!("Dropping undecodable batch: {:#}", err);
                        }
                    }
                }
            }
        }
    }
}
