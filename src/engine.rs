use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::batch::{BatchSummary, Orchestrator};
use crate::download::progress::Progress;
use crate::download::search::{Outcome, StreamDescriptor, Transfer, TransferDescriptor, TransferStrategySelector};
use crate::download::video::buffer::BufferPool;
use crate::download::{DownloadClient, RangeSource};
use crate::error::{DownloadError, Result};
use crate::file::{CachedResolver, ManifestResolver, MetadataResolver};
use crate::options::Options;
use crate::state::StateStore;

/// Everything a run needs, built once and passed down explicitly.
pub struct Engine {
    options: Options,
    client: Arc<DownloadClient>,
    store: Arc<StateStore>,
    selector: Arc<TransferStrategySelector>,
    progress: Progress,
}

impl Engine {
    pub async fn new(options: Options, progress: Progress) -> Result<Self> {
        let client = Arc::new(DownloadClient::new(&options)?);
        Self::with_source(options, Arc::clone(&client) as Arc<dyn RangeSource>, client, progress).await
    }

    /// Builds an engine whose ranged transfers go through `source`.
    pub async fn with_source(
        options: Options,
        source: Arc<dyn RangeSource>,
        client: Arc<DownloadClient>,
        progress: Progress,
    ) -> Result<Self> {
        options.validate()?;

        let store = Arc::new(StateStore::open(options.cache_dir()).await?);
        // one idle buffer per chunk worker of every active item
        let buffers = BufferPool::new(options.buffer_size, options.effective_range_concurrency());
        let selector = Arc::new(TransferStrategySelector::new(source, &options, buffers, progress.clone()));

        Ok(Self { options, client, store, selector, progress })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&self.selector) as Arc<dyn Transfer>,
            Arc::clone(&self.store),
            self.options.max_item_workers,
            self.progress.clone(),
            self.options.download_path.clone(),
        )
    }

    pub fn manifest_resolver(&self, location: &str) -> CachedResolver<ManifestResolver> {
        CachedResolver::new(
            ManifestResolver::new(location, Arc::clone(&self.client)),
            Arc::clone(&self.store),
            self.options.metadata_max_age,
            self.options.use_cache,
        )
    }

    /// Resolves and runs a batch. With `only`, just that item is run but the
    /// batch's ledger is still used.
    pub async fn run_batch(
        &self,
        resolver: &dyn MetadataResolver,
        batch: &str,
        only: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary> {
        let mut items = resolver.resolve(batch).await?;
        // numbering follows the full batch even when only one item runs
        for (position, item) in items.iter_mut().enumerate() {
            item.number.get_or_insert(position as u32 + 1);
        }
        if let Some(id) = only {
            items.retain(|item| item.id == id);
            if items.is_empty() {
                return Err(DownloadError::parse(format!("no item {id} in batch {batch}")));
            }
        }

        self.orchestrator().run(batch, &items, cancel).await
    }

    /// One ad hoc transfer outside any batch or ledger.
    pub async fn download_one(&self, url: Url, output: PathBuf, cancel: &CancellationToken) -> Outcome {
        let label = output
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| url.to_string());
        let descriptor = TransferDescriptor {
            id: url.to_string(),
            label,
            stream: StreamDescriptor::from_url(url),
            fallbacks: Vec::new(),
            expected_size: None,
            destination: output,
        };

        self.selector.transfer(&descriptor, cancel).await
    }
}
