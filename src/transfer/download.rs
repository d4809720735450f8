//! Parallel ranged downloads.
//!
//! When the caller does not give a length, the source is probed for it
//! first.  The range is then split into chunks, each fetched with its own
//! ranged read.  A chunk body that ends early is resumed with a new ranged
//! read for the missing remainder, up to `max_retry_requests_per_chunk`
//! times; this is separate from the pipeline's own request retries.

use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, StreamExt};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{partition, resolve_chunk_size, run_chunks, TransferOptions, TransferTracker};
use crate::errors::{Result, StorageError};
use crate::request::ByteRange;

/// Source of a download.
pub trait DownloadSource: Send + Sync {
    /// Total length of the source, from a metadata probe.
    fn content_length<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>>;

    /// Open a body stream for `range`.
    fn read_range<'a>(
        &'a self,
        range: ByteRange,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<BoxStream<'static, Result<Bytes>>>> + Send + 'a>>;
}

/// Read exactly `length` bytes starting at `offset`, resuming short bodies.
pub async fn read_chunk(
    source: &dyn DownloadSource,
    offset: u64,
    length: u64,
    max_retries: u32,
    cancel: &CancellationToken,
) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(length as usize);
    let mut retries = 0;

    loop {
        let received = buf.len() as u64;
        let range = ByteRange::new(offset + received, Some(length - received));
        let mut body = source.read_range(range, cancel).await?;

        while let Some(piece) = body.next().await {
            match piece {
                Ok(bytes) => {
                    if buf.len() as u64 + bytes.len() as u64 > length {
                        return Err(StorageError::StreamIntegrity {
                            expected: length,
                            received: buf.len() as u64 + bytes.len() as u64,
                        });
                    }
                    buf.extend_from_slice(&bytes);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    debug!("download: body read at offset {} failed: {}", offset, e);
                    break;
                }
            }
        }

        if buf.len() as u64 == length {
            return Ok(buf.freeze());
        }
        if retries >= max_retries {
            return Err(StorageError::StreamIntegrity {
                expected: length,
                received: buf.len() as u64,
            });
        }
        retries += 1;
        warn!(
            "download: chunk at offset {} ended after {} of {} bytes, resuming ({}/{})",
            offset,
            buf.len(),
            length,
            retries,
            max_retries
        );
    }
}

async fn resolve_length(
    source: &dyn DownloadSource,
    offset: u64,
    count: Option<u64>,
    cancel: &CancellationToken,
) -> Result<u64> {
    match count {
        Some(c) => Ok(c),
        None => {
            let size = source.content_length(cancel).await?;
            if offset > size {
                return Err(StorageError::invalid_argument(format!(
                    "offset {} is beyond the end of the source ({} bytes)",
                    offset, size
                )));
            }
            Ok(size - offset)
        }
    }
}

/// Download `[offset, offset + count)` into memory. `count == None` reads
/// to the end.
pub async fn download_to_buffer(
    source: &dyn DownloadSource,
    offset: u64,
    count: Option<u64>,
    options: &TransferOptions,
    cancel: &CancellationToken,
) -> Result<Bytes> {
    options.validate()?;
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }

    let total = resolve_length(source, offset, count, cancel).await?;
    if total == 0 {
        return Ok(Bytes::new());
    }
    let chunk_size = resolve_chunk_size(total, options.chunk_size)?;
    let chunks = partition(total, chunk_size);
    debug!(
        "download: {} bytes in {} chunks of {}",
        total,
        chunks.len(),
        chunk_size
    );

    let out = Mutex::new(vec![0u8; total as usize]);
    let tracker = TransferTracker::new("download", chunks.len(), options.on_progress.clone());
    let retries = options.max_retry_requests_per_chunk;
    run_chunks(&chunks, options.concurrency(), &tracker, cancel, |chunk| {
        let out = &out;
        async move {
            let data = read_chunk(source, offset + chunk.offset, chunk.length, retries, cancel).await?;
            let start = chunk.offset as usize;
            let mut out = out.lock().unwrap_or_else(|e| e.into_inner());
            out[start..start + data.len()].copy_from_slice(&data);
            Ok(chunk.length)
        }
    })
    .await?;

    Ok(Bytes::from(out.into_inner().unwrap_or_else(|e| e.into_inner())))
}

/// Download into `path`.
///
/// Chunks are written into a temporary file next to `path`, which replaces
/// `path` only after every chunk succeeded.  On failure the temporary file
/// is removed and `path` is left untouched.
pub async fn download_to_file(
    source: &dyn DownloadSource,
    path: &Path,
    offset: u64,
    count: Option<u64>,
    options: &TransferOptions,
    cancel: &CancellationToken,
) -> Result<u64> {
    options.validate()?;
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }

    let total = resolve_length(source, offset, count, cancel).await?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.as_file().set_len(total)?;
    let temp_path = temp.path().to_path_buf();

    if total > 0 {
        let chunk_size = resolve_chunk_size(total, options.chunk_size)?;
        let chunks = partition(total, chunk_size);
        info!(
            "download: {} bytes to {} in {} chunks of {}",
            total,
            path.display(),
            chunks.len(),
            chunk_size
        );

        let tracker = TransferTracker::new("download", chunks.len(), options.on_progress.clone());
        let retries = options.max_retry_requests_per_chunk;
        let temp_path = temp_path.as_path();
        run_chunks(&chunks, options.concurrency(), &tracker, cancel, |chunk| async move {
            let data = read_chunk(source, offset + chunk.offset, chunk.length, retries, cancel).await?;
            write_at(temp_path, chunk.offset, &data).await?;
            Ok(chunk.length)
        })
        .await?;
    }

    temp.persist(path)
        .map_err(|e| StorageError::Internal(anyhow::anyhow!("failed to persist download: {}", e)))?;
    Ok(total)
}

async fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory source. `truncate_first` cuts the first body served for
    /// each chunk after that many bytes.
    struct MemorySource {
        data: Vec<u8>,
        probes: AtomicUsize,
        reads: Mutex<Vec<ByteRange>>,
        truncate_first: Option<usize>,
        always_truncate: bool,
    }

    impl MemorySource {
        fn new(len: usize) -> Self {
            Self {
                data: (0..len).map(|i| (i % 251) as u8).collect(),
                probes: AtomicUsize::new(0),
                reads: Mutex::new(Vec::new()),
                truncate_first: None,
                always_truncate: false,
            }
        }
    }

    impl DownloadSource for MemorySource {
        fn content_length<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
            Box::pin(async move {
                self.probes.fetch_add(1, Ordering::SeqCst);
                Ok(self.data.len() as u64)
            })
        }

        fn read_range<'a>(
            &'a self,
            range: ByteRange,
            _cancel: &'a CancellationToken,
        ) -> Pin<Box<dyn Future<Output = Result<BoxStream<'static, Result<Bytes>>>> + Send + 'a>>
        {
            Box::pin(async move {
                let resumed = {
                    let mut reads = self.reads.lock().unwrap();
                    let resumed = reads
                        .iter()
                        .any(|r| r.offset < range.offset && r.offset + r.count.unwrap() > range.offset);
                    reads.push(range);
                    resumed
                };
                let start = range.offset as usize;
                let mut end = start + range.count.unwrap() as usize;
                if let Some(cut) = self.truncate_first {
                    if !resumed || self.always_truncate {
                        end = end.min(start + cut);
                    }
                }
                let body = Bytes::copy_from_slice(&self.data[start..end]);
                let pieces: Vec<Result<Bytes>> = vec![Ok(body)];
                Ok(stream::iter(pieces).boxed())
            })
        }
    }

    fn options(chunk_size: u64, concurrency: usize) -> TransferOptions {
        TransferOptions {
            chunk_size,
            max_concurrency: concurrency,
            max_retry_requests_per_chunk: 2,
            ..TransferOptions::default()
        }
    }

    #[tokio::test]
    async fn test_download_probes_length_then_reads_chunks() {
        let source = MemorySource::new(1000);
        let data = download_to_buffer(&source, 0, None, &options(256, 3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data.as_ref(), source.data.as_slice());
        assert_eq!(source.probes.load(Ordering::SeqCst), 1);
        assert_eq!(source.reads.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_download_with_count_skips_probe() {
        let source = MemorySource::new(1000);
        let data = download_to_buffer(
            &source,
            100,
            Some(300),
            &options(128, 2),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(data.as_ref(), &source.data[100..400]);
        assert_eq!(source.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_short_body_resumed_from_remainder() {
        let mut source = MemorySource::new(100);
        source.truncate_first = Some(30);
        let data = download_to_buffer(&source, 0, Some(100), &options(100, 1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data.as_ref(), source.data.as_slice());
        let reads = source.reads.lock().unwrap();
        assert_eq!(reads[1], ByteRange::new(30, Some(70)));
    }

    #[tokio::test]
    async fn test_short_body_exhausts_chunk_retries() {
        let mut source = MemorySource::new(100);
        source.truncate_first = Some(10);
        source.always_truncate = true;
        let err = download_to_buffer(&source, 0, Some(100), &options(100, 1), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            StorageError::StreamIntegrity { expected, received } => {
                assert_eq!(expected, 100);
                assert_eq!(received, 30);
            }
            other => panic!("unexpected error: {other}"),
        }
        // first read plus two resumptions
        assert_eq!(source.reads.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_download_to_file_persists_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let source = MemorySource::new(777);
        let progress = Arc::new(Mutex::new(0u64));
        let sink = progress.clone();
        let opts = TransferOptions {
            on_progress: Some(Arc::new(move |n: u64| *sink.lock().unwrap() = n)),
            ..options(200, 2)
        };
        let n = download_to_file(&source, &dest, 0, None, &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 777);
        assert_eq!(std::fs::read(&dest).unwrap(), source.data);
        assert_eq!(*progress.lock().unwrap(), 777);
        // only the destination remains, no temp files
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_download_to_file_failure_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, b"previous").unwrap();
        let mut source = MemorySource::new(300);
        source.truncate_first = Some(1);
        source.always_truncate = true;
        let err = download_to_file(&source, &dest, 0, None, &options(100, 2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "StreamIntegrityError");
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_download_makes_no_calls() {
        let source = MemorySource::new(100);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = download_to_buffer(&source, 0, None, &options(10, 2), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(source.probes.load(Ordering::SeqCst), 0);
        assert!(source.reads.lock().unwrap().is_empty());
    }
}
