pub mod download_error;

pub use download_error::DownloadError;

pub type Result<T> = std::result::Result<T, DownloadError>;
