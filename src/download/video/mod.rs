pub mod buffer;
pub mod range;
pub mod sink;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::download::progress::{Progress, ProgressSnapshot};
use crate::download::{staging_path, RangeSource};
use crate::error::{DownloadError, Result};
use crate::options::Options;

use buffer::BufferPool;
use range::ChunkScheduler;
use sink::RandomAccessSink;

/// Parallel ranged download of a single byte-addressable resource.
pub struct ChunkedRangeStrategy {
    source: Arc<dyn RangeSource>,
    scheduler: ChunkScheduler,
    progress: Progress,
}

impl ChunkedRangeStrategy {
    pub fn new(source: Arc<dyn RangeSource>, options: &Options, buffers: BufferPool, progress: Progress) -> Self {
        Self {
            source,
            scheduler: ChunkScheduler::new(options, buffers),
            progress,
        }
    }

    pub fn source(&self) -> &Arc<dyn RangeSource> {
        &self.source
    }

    /// Downloads `size` bytes of `url` into `destination`, returning the
    /// number of bytes on disk.
    pub async fn transfer(
        &self,
        url: &Url,
        size: u64,
        destination: &Path,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let staging = staging_path(destination);
        let sink = Arc::new(RandomAccessSink::create(&staging, size).await?);
        let bar = self.progress.item_bar(label, size);
        let started = Instant::now();

        let result = self
            .scheduler
            .run(Arc::clone(&self.source), url, Arc::clone(&sink), bar.clone(), cancel)
            .await;
        let closed = sink.close().await;
        let fetched = ProgressSnapshot { downloaded: bar.position(), total: Some(size), elapsed: started.elapsed() };
        self.progress.remove(&bar);

        if let Err(err) = result {
            warn!(
                path = %staging.display(),
                percent = format!("{:.1}", fetched.percent().unwrap_or(0.0)),
                "partial download left in place"
            );
            return Err(err);
        }
        closed?;

        let on_disk = tokio::fs::metadata(&staging)
            .await
            .map_err(|err| DownloadError::fs(&staging, err))?
            .len();
        if on_disk != size {
            return Err(DownloadError::CorruptOutput { path: staging, size: on_disk, minimum: size });
        }

        tokio::fs::rename(&staging, destination)
            .await
            .map_err(|err| DownloadError::fs(destination, err))?;

        info!(
            path = %destination.display(),
            bytes = size,
            mib_per_sec = format!("{:.2}", fetched.bytes_per_sec() / (1024.0 * 1024.0)),
            "download complete"
        );

        Ok(size)
    }
}
