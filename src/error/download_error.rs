use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("unexpected status {status} (expected {expected})")]
    UnexpectedStatus { status: u16, expected: u16 },

    #[error("body length mismatch: got {received} bytes, expected {expected}")]
    LengthMismatch { received: u64, expected: u64 },

    #[error("file system error at {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("corrupt output {}: {size} bytes is below the {minimum} byte minimum", path.display())]
    CorruptOutput { path: PathBuf, size: u64, minimum: u64 },

    #[error("{failed} of {total} chunks failed, first cause: {first}")]
    ChunksFailed { failed: usize, total: usize, first: Box<DownloadError> },

    #[error("remux process exited with {code:?}: {detail}")]
    RemuxFailed { code: Option<i32>, detail: String },

    #[error("no usable source for {0}")]
    NoUsableSource(String),

    #[error("worker task aborted: {0}")]
    TaskAborted(String),

    #[error("state store error: {0}")]
    State(String),

    #[error("cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem { path: path.into(), source }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseFailure(msg.into())
    }

    /// Only network and response errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::UnexpectedStatus { .. } | Self::LengthMismatch { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::UnexpectedStatus { status: status.as_u16(), expected: 200 },
            None => Self::TransientNetwork(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseFailure(err.to_string())
    }
}
