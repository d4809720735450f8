//! Parallel uploads.
//!
//! Payloads up to the single-shot threshold go out in one call.  Larger
//! ones are staged chunk by chunk and committed once every chunk succeeded.
//! The commit step is target specific: a block blob commits its block list
//! in index order, a data lake file flushes at the total length.

use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::pin::Pin;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    partition, resolve_chunk_size, run_chunks, Chunk, TransferOptions, TransferTracker,
    DEFAULT_STREAM_CHUNK_SIZE, MAX_BLOCKS,
};
use crate::errors::{Result, StorageError};

/// Destination of an upload.
pub trait UploadTarget: Send + Sync {
    /// Upload the whole payload in one call.
    fn upload_single<'a>(
        &'a self,
        data: Bytes,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Upload one chunk. Chunks may arrive in any order.
    fn stage_chunk<'a>(
        &'a self,
        chunk: Chunk,
        data: Bytes,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Make the staged chunks visible. Called exactly once, after every
    /// chunk succeeded.
    fn commit<'a>(
        &'a self,
        chunks: &'a [Chunk],
        total: u64,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Generate a block id for a staged block.
///
/// Block ids must be base64 encoded and the same length for all blocks in a
/// blob. The prefix is unique per upload so concurrent uploads to the same
/// blob do not collide.
pub fn block_id(prefix: &str, index: usize) -> String {
    let raw = format!("{}-{:06}", prefix, index);
    BASE64_STANDARD.encode(raw.as_bytes())
}

fn check_block_count(chunks: usize) -> Result<()> {
    if chunks as u64 > MAX_BLOCKS {
        return Err(StorageError::invalid_argument(format!(
            "upload needs {} chunks, more than the {} block limit; use a larger chunk_size",
            chunks, MAX_BLOCKS
        )));
    }
    Ok(())
}

/// Upload an in-memory buffer.
pub async fn upload_buffer(
    target: &dyn UploadTarget,
    data: Bytes,
    options: &TransferOptions,
    cancel: &CancellationToken,
) -> Result<u64> {
    options.validate()?;
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }

    let total = data.len() as u64;
    if total <= options.single_shot_threshold {
        debug!("upload: {} bytes in a single call", total);
        let tracker = TransferTracker::new("upload", 1, options.on_progress.clone());
        target.upload_single(data, cancel).await?;
        tracker.complete(0, total);
        return Ok(total);
    }

    let chunk_size = resolve_chunk_size(total, options.chunk_size)?;
    let chunks = partition(total, chunk_size);
    check_block_count(chunks.len())?;
    info!(
        "upload: {} bytes in {} chunks of {} (concurrency {})",
        total,
        chunks.len(),
        chunk_size,
        options.concurrency()
    );

    let tracker = TransferTracker::new("upload", chunks.len(), options.on_progress.clone());
    run_chunks(&chunks, options.concurrency(), &tracker, cancel, |chunk| {
        let piece = data.slice(chunk.offset as usize..(chunk.offset + chunk.length) as usize);
        async move {
            target.stage_chunk(chunk, piece, cancel).await?;
            Ok(chunk.length)
        }
    })
    .await?;

    target.commit(&chunks, total, cancel).await?;
    Ok(total)
}

/// Upload a local file. Each chunk is read from disk only when it is
/// scheduled, so memory use is bounded by the concurrency.
pub async fn upload_file(
    target: &dyn UploadTarget,
    path: &Path,
    options: &TransferOptions,
    cancel: &CancellationToken,
) -> Result<u64> {
    options.validate()?;
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }

    let total = tokio::fs::metadata(path).await?.len();
    if total <= options.single_shot_threshold {
        let data = tokio::fs::read(path).await?;
        return upload_buffer(target, Bytes::from(data), options, cancel).await;
    }

    let chunk_size = resolve_chunk_size(total, options.chunk_size)?;
    let chunks = partition(total, chunk_size);
    check_block_count(chunks.len())?;
    info!(
        "upload: {} ({} bytes) in {} chunks of {}",
        path.display(),
        total,
        chunks.len(),
        chunk_size
    );

    let tracker = TransferTracker::new("upload", chunks.len(), options.on_progress.clone());
    run_chunks(&chunks, options.concurrency(), &tracker, cancel, |chunk| async move {
        let piece = read_file_range(path, chunk.offset, chunk.length).await?;
        target.stage_chunk(chunk, piece, cancel).await?;
        Ok(chunk.length)
    })
    .await?;

    target.commit(&chunks, total, cancel).await?;
    Ok(total)
}

async fn read_file_range(path: &Path, offset: u64, length: u64) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Read up to `size` bytes; shorter only at end of stream.
async fn read_up_to<R: AsyncRead + Unpin>(reader: &mut R, size: u64) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(size as usize);
    while (buf.len() as u64) < size {
        let want = size as usize - buf.len();
        let n = (&mut *reader).take(want as u64).read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}

/// Read the next piece, handing the reader back with it.
async fn read_next<R: AsyncRead + Unpin>(mut reader: R, size: u64) -> (R, Result<Bytes>) {
    let piece = read_up_to(&mut reader, size).await;
    (reader, piece)
}

/// Upload a stream of unknown length.
///
/// The next piece is read while earlier pieces are being staged; at most
/// `max_concurrency` chunks are in flight plus one piece read ahead.  A
/// stream that ends within the first chunk and fits the single-shot
/// threshold is sent in one call.
pub async fn upload_stream<R>(
    target: &dyn UploadTarget,
    mut reader: R,
    options: &TransferOptions,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin + Send,
{
    options.validate()?;
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }

    let chunk_size = match options.chunk_size {
        0 => DEFAULT_STREAM_CHUNK_SIZE,
        n => n,
    };

    let first = read_up_to(&mut reader, chunk_size).await?;
    if (first.len() as u64) < chunk_size && first.len() as u64 <= options.single_shot_threshold {
        return upload_buffer(target, first, options, cancel).await;
    }

    let tracker = TransferTracker::new("upload", 0, options.on_progress.clone());
    let max_concurrency = options.concurrency();
    let mut in_flight = FuturesUnordered::new();
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut eof = (first.len() as u64) < chunk_size;
    let mut ready = Some(first).filter(|b| !b.is_empty());
    let mut reader = Some(reader);
    let mut read = None;
    let mut offset: u64 = 0;

    loop {
        while in_flight.len() < max_concurrency && !tracker.has_failed() && !cancel.is_cancelled()
        {
            let Some(piece) = ready.take() else { break };
            let chunk = Chunk {
                index: chunks.len(),
                offset,
                length: piece.len() as u64,
            };
            if let Err(e) = check_block_count(chunk.index + 1) {
                tracker.fail(chunk.index, e);
                break;
            }
            offset += chunk.length;
            chunks.push(chunk);
            tracker.start(chunk.index);
            in_flight.push(async move {
                let outcome = target.stage_chunk(chunk, piece, cancel).await;
                (chunk, outcome)
            });
        }

        if tracker.has_failed() || cancel.is_cancelled() {
            read = None;
        } else if read.is_none() && ready.is_none() && !eof {
            if let Some(r) = reader.take() {
                read = Some(Box::pin(read_next(r, chunk_size)));
            }
        }

        if in_flight.is_empty() && read.is_none() {
            break;
        }

        tokio::select! {
            Some((chunk, outcome)) = in_flight.next(), if !in_flight.is_empty() => match outcome {
                Ok(()) => tracker.complete(chunk.index, chunk.length),
                Err(e) => tracker.fail(chunk.index, e),
            },
            (r, piece) = async {
                match read.as_mut() {
                    Some(pending) => pending.await,
                    None => std::future::pending().await,
                }
            }, if read.is_some() => {
                read = None;
                reader = Some(r);
                match piece {
                    Ok(piece) => {
                        if (piece.len() as u64) < chunk_size {
                            eof = true;
                        }
                        ready = Some(piece).filter(|b| !b.is_empty());
                    }
                    Err(e) => {
                        eof = true;
                        tracker.fail(chunks.len(), e);
                    }
                }
            }
        }
    }

    let total = tracker.finish(cancel)?;
    info!("upload: streamed {} bytes in {} chunks", total, chunks.len());
    target.commit(&chunks, total, cancel).await?;
    Ok(total)
}
