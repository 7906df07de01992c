pub mod playlist;
pub mod pool;
pub mod progress;
pub mod search;
pub mod video;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, ORIGIN, RANGE, REFERER};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::error::{DownloadError, Result};
use crate::options::Options;
use video::range::Chunk;

/// A remote resource that can be probed for its length and read by byte range.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Total length of the resource, or `None` when the source does not
    /// advertise a usable one.
    async fn probe(&self, url: &Url) -> Result<Option<u64>>;

    /// Opens `chunk` for reading. The returned body must be a partial-content
    /// response for exactly that range.
    async fn open_range(&self, url: &Url, chunk: Chunk) -> Result<Box<dyn RangeBody>>;
}

#[async_trait]
pub trait RangeBody: Send {
    async fn next_bytes(&mut self) -> Result<Option<Bytes>>;
}

/// Transfers write to `<destination>.part` and rename once complete, so the
/// destination only ever exists as a finished file.
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

pub struct DownloadClient {
    client: reqwest::Client,
}

impl DownloadClient {
    pub fn new(options: &Options) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(referer) = &options.referer {
            let value = HeaderValue::from_str(referer)
                .map_err(|err| DownloadError::parse(format!("invalid referer {referer}: {err}")))?;
            headers.insert(REFERER, value.clone());
            headers.insert(ORIGIN, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(options.user_agent.as_str())
            .default_headers(headers)
            .timeout(options.request_timeout)
            .pool_max_idle_per_host(100)
            .no_gzip()
            .build()
            .map_err(|err| DownloadError::TransientNetwork(format!("failed to build http client: {err}")))?;

        Ok(Self { client })
    }

    async fn head(&self, url: &Url) -> Result<HeaderMap> {
        let response = self.client.head(url.as_str()).send().await?;
        let response = response.error_for_status()?;
        Ok(response.headers().clone())
    }

    /// Whole-body GET, used for manifests and other small documents.
    pub async fn fetch_bytes(&self, url: &Url) -> Result<Bytes> {
        let response = self.client.get(url.as_str()).send().await?;
        let response = response.error_for_status()?;
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl RangeSource for DownloadClient {
    async fn probe(&self, url: &Url) -> Result<Option<u64>> {
        let headers = self.head(url).await?;
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|length| *length > 0);

        debug!(%url, ?content_length, "probed source");
        Ok(content_length)
    }

    async fn open_range(&self, url: &Url, chunk: Chunk) -> Result<Box<dyn RangeBody>> {
        let response = self
            .client
            .get(url.as_str())
            .header(RANGE, chunk.range_header())
            .send()
            .await?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::UnexpectedStatus {
                status: response.status().as_u16(),
                expected: StatusCode::PARTIAL_CONTENT.as_u16(),
            });
        }

        Ok(Box::new(ResponseBody { response }))
    }
}

struct ResponseBody {
    response: reqwest::Response,
}

#[async_trait]
impl RangeBody for ResponseBody {
    async fn next_bytes(&mut self) -> Result<Option<Bytes>> {
        Ok(self.response.chunk().await?)
    }
}
