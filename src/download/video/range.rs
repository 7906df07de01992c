use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::buffer::{BufferPool, PooledBuffer};
use super::sink::RandomAccessSink;
use crate::download::pool::BoundedPool;
use crate::download::RangeSource;
use crate::error::{DownloadError, Result};
use crate::options::Options;

/// Half-open byte range `[start, end)` of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Inclusive range header value for this chunk.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

/// Splits `[0, total)` into `ceil(total / chunk_size)` disjoint chunks.
pub fn tile(total: u64, chunk_size: u64) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let count = total.div_ceil(chunk_size);

    (0..count)
        .map(|index| {
            let start = index * chunk_size;
            Chunk {
                index: index as usize,
                start,
                end: (start + chunk_size).min(total),
            }
        })
        .collect()
}

/// Shared state for every fetch of one resource.
struct FetchContext {
    source: Arc<dyn RangeSource>,
    url: Url,
    sink: Arc<RandomAccessSink>,
    buffers: BufferPool,
    bar: ProgressBar,
    cancel: CancellationToken,
    max_attempts: usize,
    retry_delay: Duration,
}

impl FetchContext {
    /// Fetches `chunk` with up to `max_attempts` tries; attempt `n` is
    /// preceded by a wait of `(n - 1) * retry_delay`.
    async fn fetch_chunk(&self, chunk: Chunk) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.retry_delay * (attempt - 1) as u32;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let mut buffer = self.buffers.checkout();
            let mut written = 0;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(DownloadError::Cancelled),
                result = self.fetch_once(chunk, &mut buffer, &mut written) => result,
            };

            match result {
                Ok(()) => {
                    debug!(chunk = chunk.index, attempt, "chunk complete");
                    return Ok(());
                }
                Err(err) => {
                    // bytes from a failed attempt will be fetched again
                    self.bar.dec(written);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(
                        url = %self.url,
                        chunk = chunk.index,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "chunk attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DownloadError::TransientNetwork("no attempts made".into())))
    }

    async fn fetch_once(&self, chunk: Chunk, buffer: &mut PooledBuffer, written: &mut u64) -> Result<()> {
        let expected = chunk.len();
        let mut received = 0u64;
        let mut body = self.source.open_range(&self.url, chunk).await?;

        while let Some(bytes) = body.next_bytes().await? {
            received += bytes.len() as u64;
            if received > expected {
                return Err(DownloadError::LengthMismatch { received, expected });
            }

            let mut rest = &bytes[..];
            while !rest.is_empty() {
                let take = rest.len().min(buffer.remaining());
                buffer.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
                if buffer.is_full() {
                    self.flush(chunk, buffer, written).await?;
                }
            }
        }

        if received != expected {
            return Err(DownloadError::LengthMismatch { received, expected });
        }
        self.flush(chunk, buffer, written).await
    }

    async fn flush(&self, chunk: Chunk, buffer: &mut PooledBuffer, written: &mut u64) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.sink.write_at(chunk.start + *written, &buffer[..]).await?;
        let len = buffer.len() as u64;
        *written += len;
        self.bar.inc(len);
        buffer.clear();
        Ok(())
    }
}

/// Drives the chunks of one resource through a bounded pool of fetches.
pub struct ChunkScheduler {
    chunk_size: u64,
    pool: BoundedPool,
    max_attempts: usize,
    retry_delay: Duration,
    buffers: BufferPool,
}

impl ChunkScheduler {
    pub fn new(options: &Options, buffers: BufferPool) -> Self {
        Self {
            chunk_size: options.chunk_size,
            pool: BoundedPool::new(options.max_chunk_workers),
            max_attempts: options.max_retries_per_chunk.max(1),
            retry_delay: options.retry_delay,
            buffers,
        }
    }

    /// Fills `sink` from `url`. Waits for every chunk before deciding; a
    /// single exhausted chunk fails the whole transfer and bytes already
    /// written stay where they are.
    pub async fn run(
        &self,
        source: Arc<dyn RangeSource>,
        url: &Url,
        sink: Arc<RandomAccessSink>,
        bar: ProgressBar,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let chunks = tile(sink.size(), self.chunk_size);
        let total = chunks.len();
        debug!(%url, size = sink.size(), chunks = total, "scheduling chunks");

        let context = Arc::new(FetchContext {
            source,
            url: url.clone(),
            sink,
            buffers: self.buffers.clone(),
            bar,
            cancel: cancel.clone(),
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
        });

        let run = self
            .pool
            .run(chunks, cancel, |chunk| {
                let context = Arc::clone(&context);
                async move { (chunk, context.fetch_chunk(chunk).await) }
            })
            .await;

        if !run.skipped.is_empty() {
            return Err(DownloadError::Cancelled);
        }

        let mut failures = run
            .finished
            .into_iter()
            .filter_map(|(chunk, result)| result.err().map(|err| (chunk.index, err)))
            .collect::<Vec<_>>();

        if failures.iter().any(|(_, err)| err.is_cancelled()) {
            return Err(DownloadError::Cancelled);
        }
        if run.panicked > 0 {
            failures.push((usize::MAX, DownloadError::TaskAborted(format!("{} chunk task(s)", run.panicked))));
        }

        failures.sort_by_key(|(index, _)| *index);
        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(()),
            Some((_, first)) => Err(DownloadError::ChunksFailed {
                failed,
                total,
                first: Box::new(first),
            }),
        }
    }
}
