use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::download::playlist::{ExternalRemuxStrategy, ManifestKind};
use crate::download::progress::Progress;
use crate::download::video::buffer::BufferPool;
use crate::download::video::ChunkedRangeStrategy;
use crate::download::RangeSource;
use crate::error::{DownloadError, Result};
use crate::options::Options;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressiveSource {
    pub url: Url,
    pub quality: String,
}

impl ProgressiveSource {
    /// Vertical resolution for qualities written as `"<N>p"`.
    fn height(&self) -> Option<u32> {
        self.quality.strip_suffix('p')?.parse().ok()
    }
}

/// How a resource is delivered. Unrecognised kinds deserialize to `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamDescriptor {
    Progressive { sources: Vec<ProgressiveSource> },
    Hls { url: Url },
    Dash { url: Url },
    #[serde(other)]
    Unknown,
}

impl StreamDescriptor {
    /// Guesses the delivery mode from a bare URL.
    pub fn from_url(url: Url) -> Self {
        let path = url.path().to_ascii_lowercase();
        if path.ends_with(".m3u8") {
            Self::Hls { url }
        } else if path.ends_with(".mpd") {
            Self::Dash { url }
        } else {
            Self::Progressive { sources: vec![ProgressiveSource { url, quality: "source".to_string() }] }
        }
    }
}

/// One resource to fetch. Built per item at dispatch time.
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    pub id: String,
    pub label: String,
    pub stream: StreamDescriptor,
    pub fallbacks: Vec<StreamDescriptor>,
    pub expected_size: Option<u64>,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    ChunkedRange,
    ExternalRemux,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub strategy: StrategyKind,
    pub bytes: u64,
}

#[derive(Debug)]
pub enum Outcome {
    Success(TransferReport),
    Failed(DownloadError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

impl From<Result<TransferReport>> for Outcome {
    fn from(result: Result<TransferReport>) -> Self {
        match result {
            Ok(report) => Outcome::Success(report),
            Err(err) => Outcome::Failed(err),
        }
    }
}

#[async_trait]
pub trait Transfer: Send + Sync {
    async fn transfer(&self, descriptor: &TransferDescriptor, cancel: &CancellationToken) -> Outcome;
}

/// Picks a strategy per descriptor: chunked ranges whenever a progressive
/// source probes with a length, otherwise a remux of the first manifest.
pub struct TransferStrategySelector {
    chunked: ChunkedRangeStrategy,
    remux: ExternalRemuxStrategy,
    preferred_quality: Option<String>,
}

impl TransferStrategySelector {
    pub fn new(source: Arc<dyn RangeSource>, options: &Options, buffers: BufferPool, progress: Progress) -> Self {
        Self {
            chunked: ChunkedRangeStrategy::new(source, options, buffers, progress.clone()),
            remux: ExternalRemuxStrategy::new(options, progress),
            preferred_quality: options.preferred_quality.clone(),
        }
    }

    /// The configured quality if offered, otherwise the highest `<N>p`.
    pub fn pick_source<'a>(&self, sources: &'a [ProgressiveSource]) -> Option<&'a ProgressiveSource> {
        if let Some(preferred) = &self.preferred_quality {
            if let Some(source) = sources.iter().find(|source| &source.quality == preferred) {
                return Some(source);
            }
        }
        sources
            .iter()
            .max_by_key(|source| source.height().unwrap_or(0))
    }

    async fn run(&self, descriptor: &TransferDescriptor, cancel: &CancellationToken) -> Result<TransferReport> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if let Some(parent) = descriptor.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| DownloadError::fs(parent, err))?;
        }

        let mut probe_error = None;
        let candidates = std::iter::once(&descriptor.stream).chain(descriptor.fallbacks.iter());

        for candidate in candidates {
            match candidate {
                StreamDescriptor::Progressive { sources } => {
                    let Some(source) = self.pick_source(sources) else {
                        continue;
                    };
                    let probed = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        probed = self.chunked.source().probe(&source.url) => probed,
                    };
                    match probed {
                        Ok(Some(size)) => {
                            if let Some(expected) = descriptor.expected_size.filter(|expected| *expected != size) {
                                warn!(id = %descriptor.id, expected, probed = size, "size differs from metadata");
                            }
                            debug!(id = %descriptor.id, quality = %source.quality, size, "using chunked transfer");
                            let bytes = self
                                .chunked
                                .transfer(&source.url, size, &descriptor.destination, &descriptor.label, cancel)
                                .await?;
                            return Ok(TransferReport { strategy: StrategyKind::ChunkedRange, bytes });
                        }
                        Ok(None) => {
                            info!(id = %descriptor.id, url = %source.url, "source has no usable length");
                        }
                        Err(err) => {
                            warn!(id = %descriptor.id, url = %source.url, error = %err, "probe failed");
                            probe_error = Some(err);
                        }
                    }
                }
                StreamDescriptor::Hls { url } => {
                    return self.remux(url, ManifestKind::Hls, descriptor, cancel).await;
                }
                StreamDescriptor::Dash { url } => {
                    return self.remux(url, ManifestKind::Dash, descriptor, cancel).await;
                }
                StreamDescriptor::Unknown => {
                    return Err(DownloadError::parse(format!("unknown stream kind for {}", descriptor.id)));
                }
            }
        }

        Err(probe_error.unwrap_or_else(|| DownloadError::NoUsableSource(descriptor.id.clone())))
    }

    async fn remux(
        &self,
        url: &Url,
        kind: ManifestKind,
        descriptor: &TransferDescriptor,
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        debug!(id = %descriptor.id, ?kind, "using external remux");
        let bytes = self
            .remux
            .transfer(url, kind, &descriptor.destination, &descriptor.label, cancel)
            .await?;
        Ok(TransferReport { strategy: StrategyKind::ExternalRemux, bytes })
    }
}

#[async_trait]
impl Transfer for TransferStrategySelector {
    async fn transfer(&self, descriptor: &TransferDescriptor, cancel: &CancellationToken) -> Outcome {
        self.run(descriptor, cancel).await.into()
    }
}

/// Present with a non-zero size.
pub async fn verified_on_disk(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file() && metadata.len() > 0,
        Err(_) => false,
    }
}
