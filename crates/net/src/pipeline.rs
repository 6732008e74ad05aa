//! Parallel compression pipeline.
//!
//! A fixed pool of long-lived worker slots compresses (and decompresses)
//! serialized batches off the dispatch path. Batches are assigned to the
//! least-loaded slot, ties broken by lowest worker id. Completions are
//! delivered in whatever order workers finish; reordering is deliberately
//! left to the link protocol, the only component with authority over wire
//! order.

use crate::batch::LinkId;
use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Attempts a batch gets across distinct slots before it is surfaced as a
/// permanent failure (which the link protocol encodes as a gap marker).
pub const MAX_COMPRESS_ATTEMPTS: u32 = 3;

/// zstd level; dictionary matching across the concatenated packet bytes is
/// where most of the win comes from, so mid-level is plenty.
const COMPRESSION_LEVEL: i32 = 6;

/// Identifier of one worker slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

/// Direction of the transform a job asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Serialized batch -> compressed frame payload.
    Compress,
    /// Received frame payload -> serialized batch.
    Decompress,
}

/// One unit of work for the pool.
#[derive(Debug, Clone)]
pub struct Job {
    /// Link direction the result routes back to.
    pub link: LinkId,
    /// Batch sequence number, carried through untouched.
    pub sequence: u64,
    /// Transform direction.
    pub kind: JobKind,
    /// Input bytes.
    pub data: Vec<u8>,
}

/// Completion (or permanent failure) of a submitted job.
#[derive(Debug)]
pub enum PipelineEvent {
    /// The job finished; `data` is the transform output.
    Complete {
        /// Link the job belongs to.
        link: LinkId,
        /// Batch sequence number from the job.
        sequence: u64,
        /// Transform direction.
        kind: JobKind,
        /// Output bytes.
        data: Vec<u8>,
        /// Uncompressed size (input for compress, output for decompress).
        raw_len: usize,
        /// Slot that produced the result.
        worker: WorkerId,
    },
    /// The job failed on `MAX_COMPRESS_ATTEMPTS` distinct slots.
    Failed {
        /// Link the job belongs to.
        link: LinkId,
        /// Batch sequence number that will never complete.
        sequence: u64,
        /// Transform direction.
        kind: JobKind,
    },
}

enum Command {
    Submit(Job),
    Cancel(LinkId),
}

/// Cloneable handle for submitting work to the pool.
#[derive(Clone)]
pub struct PipelineHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl PipelineHandle {
    /// Queue a job for the least-loaded slot.
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.cmd_tx
            .send(Command::Submit(job))
            .await
            .map_err(|_| anyhow::anyhow!("Compression pipeline is gone"))
    }

    /// Discard all in-flight and queued results for a link.
    ///
    /// Work already running for other links is unaffected; the pool is
    /// shared, not link-owned.
    pub async fn cancel(&self, link: LinkId) -> Result<()> {
        self.cmd_tx
            .send(Command::Cancel(link))
            .await
            .map_err(|_| anyhow::anyhow!("Compression pipeline is gone"))
    }
}

struct WorkRequest {
    job: Job,
    attempts: u32,
    epoch: u64,
}

struct WorkOutcome {
    worker: usize,
    request: WorkRequest,
    result: Result<Vec<u8>, String>,
}

struct WorkerSlot {
    id: usize,
    load: usize,
    work_tx: mpsc::UnboundedSender<WorkRequest>,
}

/// Start the pool and its dispatcher.
///
/// Returns the submission handle and the completion stream. Completions
/// arrive in worker-finish order, not submission order.
pub fn spawn_pipeline(worker_count: usize) -> (PipelineHandle, mpsc::Receiver<PipelineEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(1024);
    let (event_tx, event_rx) = mpsc::channel(1024);
    tokio::spawn(dispatcher(worker_count.max(1), cmd_rx, event_tx));
    (PipelineHandle { cmd_tx }, event_rx)
}

async fn dispatcher(
    worker_count: usize,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<PipelineEvent>,
) {
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let mut workers: Vec<WorkerSlot> = (0..worker_count)
        .map(|id| spawn_worker(id, outcome_tx.clone()))
        .collect();
    // Cancellation epochs: a stale epoch on a completion means the link was
    // cancelled after submission, and the result is dropped.
    let mut epochs: HashMap<LinkId, u64> = HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => break,
                Some(Command::Submit(job)) => {
                    let epoch = *epochs.entry(job.link).or_insert(0);
                    let request = WorkRequest { job, attempts: 1, epoch };
                    assign(&mut workers, request, None, &outcome_tx);
                }
                Some(Command::Cancel(link)) => {
                    *epochs.entry(link).or_insert(0) += 1;
                    debug!("Cancelled pending pipeline work for link {}", link.0);
                }
            },
            outcome = outcome_rx.recv() => {
                let Some(outcome) = outcome else { break };
                let slot_load = {
                    let slot = workers
                        .iter_mut()
                        .find(|w| w.id == outcome.worker)
                        .expect("outcome from unknown worker");
                    slot.load = slot.load.saturating_sub(1);
                    slot.load
                };

                let current = epochs.get(&outcome.request.job.link).copied().unwrap_or(0);
                if outcome.request.epoch != current {
                    trace!(
                        "Dropping cancelled result for link {} seq {}",
                        outcome.request.job.link.0,
                        outcome.request.job.sequence
                    );
                    continue;
                }

                match outcome.result {
                    Ok(data) => {
                        let job = outcome.request.job;
                        let raw_len = match job.kind {
                            JobKind::Compress => job.data.len(),
                            JobKind::Decompress => data.len(),
                        };
                        let event = PipelineEvent::Complete {
                            link: job.link,
                            sequence: job.sequence,
                            kind: job.kind,
                            data,
                            raw_len,
                            worker: WorkerId(outcome.worker),
                        };
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(
                            "Worker {} failed batch seq {} (attempt {}): {}",
                            outcome.worker,
                            outcome.request.job.sequence,
                            outcome.request.attempts,
                            err
                        );
                        let failed_worker = outcome.worker;
                        // Replace the suspect slot once it has nothing else
                        // queued; its in-flight state is unknown after a
                        // failure.
                        if slot_load == 0 {
                            if let Some(slot) =
                                workers.iter_mut().find(|w| w.id == failed_worker)
                            {
                                *slot = spawn_worker(failed_worker, outcome_tx.clone());
                            }
                        }

                        let mut request = outcome.request;
                        request.attempts += 1;
                        if request.attempts > MAX_COMPRESS_ATTEMPTS {
                            let job = request.job;
                            let event = PipelineEvent::Failed {
                                link: job.link,
                                sequence: job.sequence,
                                kind: job.kind,
                            };
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        } else {
                            assign(&mut workers, request, Some(failed_worker), &outcome_tx);
                        }
                    }
                }
            }
        }
    }
}

/// Hand a request to the least-loaded slot, ties to lowest id.
///
/// `avoid` excludes the slot a retry just failed on (ignored for a pool of
/// one). A slot whose channel is gone is respawned in place.
fn assign(
    workers: &mut [WorkerSlot],
    request: WorkRequest,
    avoid: Option<usize>,
    outcome_tx: &mpsc::UnboundedSender<WorkOutcome>,
) {
    let pool = workers.len();
    let mut request = request;
    loop {
        let slot = workers
            .iter_mut()
            .filter(|w| pool == 1 || avoid != Some(w.id))
            .min_by_key(|w| (w.load, w.id))
            .expect("worker pool is never empty");
        match slot.work_tx.send(request) {
            Ok(()) => {
                slot.load += 1;
                return;
            }
            Err(mpsc::error::SendError(returned)) => {
                let id = slot.id;
                *slot = spawn_worker(id, outcome_tx.clone());
                request = returned;
            }
        }
    }
}

fn spawn_worker(id: usize, outcome_tx: mpsc::UnboundedSender<WorkOutcome>) -> WorkerSlot {
    let (work_tx, mut work_rx) = mpsc::unbounded_channel::<WorkRequest>();
    tokio::spawn(async move {
        while let Some(request) = work_rx.recv().await {
            let kind = request.job.kind;
            let input = request.job.data.clone();
            let result = tokio::task::spawn_blocking(move || transform(kind, &input))
                .await
                .map_err(|e| format!("Worker task panicked: {e}"))
                .and_then(|r| r);
            if outcome_tx
                .send(WorkOutcome {
                    worker: id,
                    request,
                    result,
                })
                .is_err()
            {
                break;
            }
        }
    });
    WorkerSlot {
        id,
        load: 0,
        work_tx,
    }
}

fn transform(kind: JobKind, data: &[u8]) -> Result<Vec<u8>, String> {
    match kind {
        JobKind::Compress => zstd::stream::encode_all(data, COMPRESSION_LEVEL)
            .map_err(|e| format!("zstd compression failed: {e}")),
        JobKind::Decompress => {
            zstd::stream::decode_all(data).map_err(|e| format!("zstd decompression failed: {e}"))
        }
    }
}
