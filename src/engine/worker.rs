//! Decompression worker boundary.
//!
//! Decoding a tile means inflating its chunks and replaying the deltas,
//! which is the expensive part of ingesting tiles. Batches are handed to a
//! dedicated OS thread over a channel; the owning thread picks up the
//! results when it next polls. [`decode_batch`] is the same work done inline
//! and serves as the fallback when no worker is running.
//!
//! ```text
//!  owning thread                          "tile-decompress" thread
//!  ─────────────                          ────────────────────────
//!  submit(DecodeBatch) ──── jobs ───────▶ decode_batch()
//!  try_recv() / recv() ◀─── replies ───── WorkerReply
//! ```
//!
//! Only owned buffers cross the boundary. A panic while decoding is caught
//! on the worker and reported as [`WorkerReply::Failed`].

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, trace};

use crate::error::{DeltaError, WorkerError};
use crate::tile::{DeltaDecoder, RehydrationSlice, TileCoordinate};

/// Name of the worker thread.
pub const WORKER_THREAD_NAME: &str = "tile-decompress";

// =============================================================================
// Messages
// =============================================================================

/// One tile's chunks to decode.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub coords: TileCoordinate,
    pub slice: RehydrationSlice,
}

/// Everything queued by one outermost transaction.
#[derive(Debug, Clone)]
pub struct DecodeBatch {
    pub generation: u64,
    pub tile_size: usize,
    pub debug: bool,
    pub requests: Vec<DecodeRequest>,
}

/// Decoded pixels for one request.
#[derive(Debug, Clone)]
pub struct DecodeResult {
    pub coords: TileCoordinate,
    pub last_id: u64,
    pub pixels: Result<Vec<u8>, DeltaError>,
}

/// What the worker sends back for a batch.
#[derive(Debug)]
pub enum WorkerReply {
    Decoded {
        generation: u64,
        results: Vec<DecodeResult>,
    },
    Failed {
        generation: u64,
        reason: String,
    },
}

/// Decode every request of a batch on the calling thread.
pub fn decode_batch(batch: DecodeBatch) -> Vec<DecodeResult> {
    let decoder = DeltaDecoder::new(batch.tile_size).with_debug(batch.debug);
    batch
        .requests
        .into_iter()
        .map(|req| {
            let pixels = decoder.rehydrate(&req.slice.chunks, req.slice.base.as_deref());
            if batch.debug {
                trace!(
                    key = %req.coords,
                    first = req.slice.first_id,
                    last = req.slice.last_id,
                    ok = pixels.is_ok(),
                    "Decoded tile"
                );
            }
            DecodeResult {
                coords: req.coords,
                last_id: req.slice.last_id,
                pixels,
            }
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Handle to the decompression thread.
///
/// Dropping the handle closes the job channel, which ends the thread after
/// its current batch.
#[derive(Debug)]
pub struct DecompressionWorker {
    jobs: Option<mpsc::UnboundedSender<DecodeBatch>>,
    replies: mpsc::UnboundedReceiver<WorkerReply>,
    handle: Option<JoinHandle<()>>,
}

impl DecompressionWorker {
    /// Start the worker thread.
    pub fn spawn() -> Result<Self, WorkerError> {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<DecodeBatch>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<WorkerReply>();

        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                while let Some(batch) = job_rx.blocking_recv() {
                    let generation = batch.generation;
                    let reply = match catch_unwind(AssertUnwindSafe(|| decode_batch(batch))) {
                        Ok(results) => WorkerReply::Decoded {
                            generation,
                            results,
                        },
                        Err(payload) => WorkerReply::Failed {
                            generation,
                            reason: panic_message(payload.as_ref()),
                        },
                    };
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
                debug!("Decompression worker exiting");
            })
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        debug!("Decompression worker started");
        Ok(Self {
            jobs: Some(job_tx),
            replies: reply_rx,
            handle: Some(handle),
        })
    }

    /// Queue a batch for decoding.
    pub fn submit(&self, batch: DecodeBatch) -> Result<(), WorkerError> {
        let jobs = self.jobs.as_ref().ok_or(WorkerError::Disconnected)?;
        jobs.send(batch).map_err(|_| WorkerError::Disconnected)
    }

    /// Non-blocking check for a reply.
    pub fn try_recv(&mut self) -> Result<Option<WorkerReply>, WorkerError> {
        match self.replies.try_recv() {
            Ok(reply) => Ok(Some(reply)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(WorkerError::Disconnected),
        }
    }

    /// Wait for the next reply.
    pub async fn recv(&mut self) -> Result<WorkerReply, WorkerError> {
        self.replies.recv().await.ok_or(WorkerError::Disconnected)
    }

    /// Stop accepting work. The thread exits once its current batch is done.
    pub fn terminate(&mut self) {
        self.jobs = None;
        // Detach: joining could block on a long batch.
        self.handle.take();
    }

    pub fn is_running(&self) -> bool {
        self.jobs.is_some()
    }
}

impl Drop for DecompressionWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

// =============================================================================
// Tests
// =============================================================================
