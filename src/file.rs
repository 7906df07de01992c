use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::download::search::{StreamDescriptor, TransferDescriptor};
use crate::download::DownloadClient;
use crate::error::{DownloadError, Result};
use crate::state::StateStore;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub number: Option<u32>,
    pub stream: StreamDescriptor,
    #[serde(default)]
    pub fallbacks: Vec<StreamDescriptor>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl ItemRecord {
    /// Explicit outputs are taken relative to `root`; otherwise
    /// `<root>/<batch>/<NN>-<title>.mp4`.
    pub fn destination(&self, root: &Path, batch: &str, position: usize) -> PathBuf {
        match &self.output {
            Some(output) => root.join(output),
            None => {
                let number = self.number.unwrap_or(position as u32 + 1);
                root.join(sanitize_filename(batch))
                    .join(format!("{:02}-{}.mp4", number, sanitize_filename(&self.title)))
            }
        }
    }

    pub fn descriptor(&self, root: &Path, batch: &str, position: usize) -> TransferDescriptor {
        TransferDescriptor {
            id: self.id.clone(),
            label: self.title.clone(),
            stream: self.stream.clone(),
            fallbacks: self.fallbacks.clone(),
            expected_size: self.size,
            destination: self.destination(root, batch, position),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    items: Vec<ItemRecord>,
}

pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Default batch name for a manifest location: its file stem.
pub fn batch_name(location: &str) -> String {
    let path = match Url::parse(location) {
        Ok(url) if url.scheme().starts_with("http") => url.path().to_string(),
        _ => location.to_string(),
    };
    let stem = Path::new(&path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = sanitize_filename(&stem);
    if name.is_empty() {
        "batch".to_string()
    } else {
        name
    }
}

/// Supplies the ordered items of a batch.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, batch: &str) -> Result<Vec<ItemRecord>>;
}

/// Reads a JSON manifest from a local path or an http(s) URL.
pub struct ManifestResolver {
    location: String,
    client: Arc<DownloadClient>,
}

impl ManifestResolver {
    pub fn new(location: impl Into<String>, client: Arc<DownloadClient>) -> Self {
        Self { location: location.into(), client }
    }

    async fn read(&self) -> Result<Vec<u8>> {
        match Url::parse(&self.location) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                Ok(self.client.fetch_bytes(&url).await?.to_vec())
            }
            _ => tokio::fs::read(&self.location)
                .await
                .map_err(|err| DownloadError::fs(&self.location, err)),
        }
    }
}

#[async_trait]
impl MetadataResolver for ManifestResolver {
    async fn resolve(&self, batch: &str) -> Result<Vec<ItemRecord>> {
        let bytes = self.read().await?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|err| DownloadError::parse(format!("manifest {}: {}", self.location, err)))?;

        debug!(batch, location = %self.location, items = manifest.items.len(), "manifest resolved");
        Ok(manifest.items)
    }
}

/// Serves resolved items from the metadata partition while they are fresh.
pub struct CachedResolver<R> {
    inner: R,
    store: Arc<StateStore>,
    max_age: Duration,
    use_cache: bool,
}

impl<R: MetadataResolver> CachedResolver<R> {
    pub fn new(inner: R, store: Arc<StateStore>, max_age: Duration, use_cache: bool) -> Self {
        Self { inner, store, max_age, use_cache }
    }

    pub fn key(batch: &str) -> String {
        format!("meta_{batch}")
    }
}

#[async_trait]
impl<R: MetadataResolver> MetadataResolver for CachedResolver<R> {
    async fn resolve(&self, batch: &str) -> Result<Vec<ItemRecord>> {
        let key = Self::key(batch);

        if self.use_cache && !self.store.is_stale(&key, self.max_age).await {
            match self.store.get::<Vec<ItemRecord>>(&key).await {
                Ok(Some(items)) => {
                    info!(batch, items = items.len(), "using cached metadata");
                    return Ok(items);
                }
                Ok(None) => {}
                Err(err) => warn!(batch, error = %err, "cached metadata unreadable"),
            }
        }

        let items = self.inner.resolve(batch).await?;
        if let Err(err) = self.store.set(&key, &items).await {
            warn!(batch, error = %err, "failed to cache metadata");
        }
        Ok(items)
    }
}
