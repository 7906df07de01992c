use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DownloadError, Result};

pub const MIB: u64 = 1024 * 1024;

pub const VALID_QUALITIES: [&str; 4] = ["360p", "540p", "720p", "1080p"];

/// Range requests above this are likely to trip per-host limits.
pub const RANGE_CONCURRENCY_WARNING: usize = 64;

#[derive(Debug, Clone)]
pub struct Options {
    pub chunk_size: u64,
    pub max_chunk_workers: usize,
    pub max_item_workers: usize,
    /// Total attempts per chunk, including the first one.
    pub max_retries_per_chunk: usize,
    pub retry_delay: Duration,
    pub buffer_size: usize,
    pub request_timeout: Duration,
    pub min_output_size: u64,
    pub metadata_max_age: Duration,
    pub download_path: PathBuf,
    pub preferred_quality: Option<String>,
    pub use_cache: bool,
    pub show_progress: bool,
    pub ffmpeg: PathBuf,
    pub user_agent: String,
    pub referer: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            chunk_size: 20 * MIB,
            max_chunk_workers: 15,
            max_item_workers: 15,
            max_retries_per_chunk: 3,
            retry_delay: Duration::from_secs(1),
            buffer_size: 32 * 1024,
            request_timeout: Duration::from_secs(30),
            min_output_size: MIB,
            metadata_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            download_path: PathBuf::from("downloads"),
            preferred_quality: None,
            use_cache: true,
            show_progress: true,
            ffmpeg: PathBuf::from("ffmpeg"),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; rv:78.0) Gecko/20100101 Firefox/78.0".to_string(),
            referer: None,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(DownloadError::parse("chunk size must be greater than zero"));
        }
        if self.max_chunk_workers == 0 || self.max_item_workers == 0 {
            return Err(DownloadError::parse("worker counts must be greater than zero"));
        }
        if self.max_retries_per_chunk == 0 {
            return Err(DownloadError::parse("at least one attempt per chunk is required"));
        }
        if self.buffer_size == 0 {
            return Err(DownloadError::parse("buffer size must be greater than zero"));
        }
        if let Some(quality) = &self.preferred_quality {
            if !VALID_QUALITIES.contains(&quality.as_str()) {
                return Err(DownloadError::parse(format!(
                    "invalid quality {quality}, expected one of {}",
                    VALID_QUALITIES.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Upper bound on concurrent range requests across all active items.
    pub fn effective_range_concurrency(&self) -> usize {
        self.max_item_workers.saturating_mul(self.max_chunk_workers)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.download_path.join(".cache")
    }
}
