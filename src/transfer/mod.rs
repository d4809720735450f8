//! Parallel chunked transfers.
//!
//! Large payloads are split into ordered chunks.  Chunk operations are
//! futures multiplexed on the calling task through a `FuturesUnordered`,
//! so the concurrency bound is simply the number of futures kept in the
//! set.  Chunks start in order of increasing offset and may complete in any
//! order.  Shared state (progress counter, per-chunk state, first error)
//! lives in a [`TransferTracker`] behind one mutex.
//!
//! Failure handling: the first chunk error becomes the transfer's error, no
//! further chunks start, in-flight chunks run to completion and any later
//! errors are logged and dropped.

pub mod download;
pub mod upload;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{Result, StorageError};
use crate::metrics::TRANSFERRED_BYTES_TOTAL;

pub use download::{download_to_buffer, download_to_file, DownloadSource};
pub use upload::{upload_buffer, upload_file, upload_stream, UploadTarget};

pub const MIB: u64 = 1024 * 1024;

/// Smallest chunk size chosen automatically.
pub const MIN_AUTO_CHUNK_SIZE: u64 = 4 * MIB;

/// Largest block the service accepts in one Stage Block call.
pub const MAX_STAGE_BLOCK_SIZE: u64 = 4000 * MIB;

/// Largest payload the service accepts in one Put Blob call.
pub const MAX_SINGLE_SHOT_SIZE: u64 = 256 * MIB;

/// Most blocks a single block blob may hold.
pub const MAX_BLOCKS: u64 = 50_000;

/// Chunk size for streams of unknown length when none is configured.
pub const DEFAULT_STREAM_CHUNK_SIZE: u64 = 8 * MIB;

pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Tuning for uploads and downloads.
#[derive(Clone, Deserialize)]
pub struct TransferOptions {
    /// Bytes per chunk; 0 chooses automatically.
    #[serde(default)]
    pub chunk_size: u64,

    /// Most chunk operations outstanding at once; 0 is treated as 1.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Payloads up to this size are sent in one call.
    #[serde(default = "default_single_shot_threshold")]
    pub single_shot_threshold: u64,

    /// Extra ranged reads per download chunk when its body ends early.
    #[serde(default = "default_max_retry_requests_per_chunk")]
    pub max_retry_requests_per_chunk: u32,

    /// Send a transactional Content-MD5 with each chunk.
    #[serde(default)]
    pub transactional_md5: bool,

    /// Called with the running byte total after each chunk completes.
    #[serde(skip)]
    pub on_progress: Option<ProgressFn>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            max_concurrency: default_max_concurrency(),
            single_shot_threshold: default_single_shot_threshold(),
            max_retry_requests_per_chunk: default_max_retry_requests_per_chunk(),
            transactional_md5: false,
            on_progress: None,
        }
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("chunk_size", &self.chunk_size)
            .field("max_concurrency", &self.max_concurrency)
            .field("single_shot_threshold", &self.single_shot_threshold)
            .field(
                "max_retry_requests_per_chunk",
                &self.max_retry_requests_per_chunk,
            )
            .field("transactional_md5", &self.transactional_md5)
            .field("on_progress", &self.on_progress.as_ref().map(|_| "callback"))
            .finish()
    }
}

fn default_max_concurrency() -> usize {
    5
}

fn default_single_shot_threshold() -> u64 {
    MAX_SINGLE_SHOT_SIZE
}

fn default_max_retry_requests_per_chunk() -> u32 {
    5
}

impl TransferOptions {
    pub fn validate(&self) -> Result<()> {
        if self.single_shot_threshold > MAX_SINGLE_SHOT_SIZE {
            return Err(StorageError::invalid_argument(format!(
                "single_shot_threshold must not exceed {} bytes",
                MAX_SINGLE_SHOT_SIZE
            )));
        }
        if self.chunk_size > MAX_STAGE_BLOCK_SIZE {
            return Err(StorageError::invalid_argument(format!(
                "chunk_size must not exceed {} bytes",
                MAX_STAGE_BLOCK_SIZE
            )));
        }
        Ok(())
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

/// Pick the chunk size for a payload of `total` bytes.
///
/// An explicit `requested` size is used as-is.  Otherwise the size is
/// `ceil(total / 50_000)` so the payload fits the block limit, raised to
/// at least 4 MiB and capped at the stage-block maximum.
pub fn resolve_chunk_size(total: u64, requested: u64) -> Result<u64> {
    if requested > MAX_STAGE_BLOCK_SIZE {
        return Err(StorageError::invalid_argument(format!(
            "chunk_size must not exceed {} bytes",
            MAX_STAGE_BLOCK_SIZE
        )));
    }
    if requested > 0 {
        return Ok(requested);
    }
    Ok(total
        .div_ceil(MAX_BLOCKS)
        .max(MIN_AUTO_CHUNK_SIZE)
        .min(MAX_STAGE_BLOCK_SIZE))
}

/// One contiguous piece of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
}

/// Split `[0, total)` into `ceil(total / chunk_size)` ordered chunks; the
/// last one may be shorter.
pub fn partition(total: u64, chunk_size: u64) -> Vec<Chunk> {
    if total == 0 || chunk_size == 0 {
        return Vec::new();
    }
    let count = total.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            Chunk {
                index: i as usize,
                offset,
                length: chunk_size.min(total - offset),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Done,
    Failed,
}

struct TrackerState {
    transferred: u64,
    first_error: Option<StorageError>,
    chunks: Vec<ChunkState>,
}

/// Progress counter, chunk states and first-error slot of one transfer.
pub struct TransferTracker {
    direction: &'static str,
    state: Mutex<TrackerState>,
    on_progress: Option<ProgressFn>,
}

impl TransferTracker {
    pub fn new(direction: &'static str, chunks: usize, on_progress: Option<ProgressFn>) -> Self {
        Self {
            direction,
            state: Mutex::new(TrackerState {
                transferred: 0,
                first_error: None,
                chunks: vec![ChunkState::Pending; chunks],
            }),
            on_progress,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(state: &mut TrackerState, index: usize, to: ChunkState) {
        if index >= state.chunks.len() {
            state.chunks.resize(index + 1, ChunkState::Pending);
        }
        state.chunks[index] = to;
    }

    pub fn start(&self, index: usize) {
        Self::set_state(&mut self.lock(), index, ChunkState::InFlight);
    }

    /// Record a finished chunk and report the new running total.
    pub fn complete(&self, index: usize, bytes: u64) {
        let total = {
            let mut state = self.lock();
            Self::set_state(&mut state, index, ChunkState::Done);
            state.transferred += bytes;
            state.transferred
        };
        metrics::counter!(TRANSFERRED_BYTES_TOTAL, "direction" => self.direction).increment(bytes);
        if let Some(on_progress) = &self.on_progress {
            on_progress(total);
        }
    }

    /// Record a failed chunk. Only the first error is kept.
    pub fn fail(&self, index: usize, error: StorageError) {
        let mut state = self.lock();
        Self::set_state(&mut state, index, ChunkState::Failed);
        if state.first_error.is_none() {
            warn!("{}: chunk {} failed: {}", self.direction, index, error);
            state.first_error = Some(error);
        } else {
            debug!(
                "{}: chunk {} also failed, dropping error: {}",
                self.direction, index, error
            );
        }
    }

    pub fn has_failed(&self) -> bool {
        self.lock().first_error.is_some()
    }

    pub fn transferred(&self) -> u64 {
        self.lock().transferred
    }

    pub fn chunk_states(&self) -> Vec<ChunkState> {
        self.lock().chunks.clone()
    }

    /// Outcome of the transfer once nothing is in flight any more.
    /// Cancellation takes priority over chunk errors.
    pub fn finish(&self, cancel: &CancellationToken) -> Result<u64> {
        let mut state = self.lock();
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        match state.first_error.take() {
            Some(e) => Err(e),
            None => Ok(state.transferred),
        }
    }
}

/// Run `op` over `chunks` with at most `max_concurrency` outstanding.
///
/// `op` returns the number of bytes the chunk moved.  No chunk starts once
/// the token is cancelled or a chunk has failed.
pub async fn run_chunks<F, Fut>(
    chunks: &[Chunk],
    max_concurrency: usize,
    tracker: &TransferTracker,
    cancel: &CancellationToken,
    op: F,
) -> Result<u64>
where
    F: Fn(Chunk) -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    let max_concurrency = max_concurrency.max(1);
    let mut in_flight = FuturesUnordered::new();
    let mut pending = chunks.iter().copied();

    loop {
        while in_flight.len() < max_concurrency && !tracker.has_failed() && !cancel.is_cancelled()
        {
            let Some(chunk) = pending.next() else { break };
            tracker.start(chunk.index);
            let fut = op(chunk);
            in_flight.push(async move { (chunk, fut.await) });
        }

        match in_flight.next().await {
            Some((chunk, Ok(bytes))) => tracker.complete(chunk.index, bytes),
            Some((chunk, Err(e))) => tracker.fail(chunk.index, e),
            None => break,
        }
    }

    tracker.finish(cancel)
}
