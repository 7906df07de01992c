use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{DownloadError, Result};

/// A pre-sized file that accepts writes at arbitrary offsets from many tasks.
///
/// One handle is shared; seek and write happen under the lock so two writers
/// can never interleave between them.
pub struct RandomAccessSink {
    path: PathBuf,
    len: u64,
    file: Mutex<Option<File>>,
}

impl RandomAccessSink {
    pub async fn create(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|err| DownloadError::fs(path, err))?;

        file.set_len(len).await.map_err(|err| DownloadError::fs(path, err))?;

        Ok(Self {
            path: path.to_path_buf(),
            len,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub async fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = offset + bytes.len() as u64;
        if end > self.len {
            let err = std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("write of {}..{} past end {}", offset, end, self.len),
            );
            return Err(DownloadError::fs(&self.path, err));
        }

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| {
            DownloadError::fs(&self.path, std::io::Error::new(std::io::ErrorKind::Other, "sink is closed"))
        })?;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| DownloadError::fs(&self.path, err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| DownloadError::fs(&self.path, err))?;
        file.flush().await.map_err(|err| DownloadError::fs(&self.path, err))?;

        Ok(())
    }

    /// Flushes to disk and releases the handle. Calling it twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let file = self.file.lock().await.take();
        if let Some(file) = file {
            file.sync_all().await.map_err(|err| DownloadError::fs(&self.path, err))?;
        }
        Ok(())
    }
}
