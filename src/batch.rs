use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::download::pool::BoundedPool;
use crate::download::progress::Progress;
use crate::download::search::{verified_on_disk, Outcome, Transfer, TransferDescriptor};
use crate::error::{DownloadError, Result};
use crate::file::ItemRecord;
use crate::state::ledger::Ledger;
use crate::state::StateStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub id: String,
    pub title: String,
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub already_complete: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub failures: Vec<ItemFailure>,
}

impl BatchSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastRun {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    summary: BatchSummary,
}

/// Runs the items of a batch through a bounded pool of transfers, skipping
/// what the ledger and the disk agree is done.
pub struct Orchestrator {
    transfer: Arc<dyn Transfer>,
    store: Arc<StateStore>,
    pool: BoundedPool,
    progress: Progress,
    download_path: PathBuf,
}

impl Orchestrator {
    pub fn new(
        transfer: Arc<dyn Transfer>,
        store: Arc<StateStore>,
        max_item_workers: usize,
        progress: Progress,
        download_path: PathBuf,
    ) -> Self {
        Self {
            transfer,
            store,
            pool: BoundedPool::new(max_item_workers),
            progress,
            download_path,
        }
    }

    pub fn last_run_key(batch: &str) -> String {
        format!("last_run_{batch}")
    }

    /// Individual item failures are counted in the summary, never returned
    /// as an error.
    pub async fn run(&self, batch: &str, items: &[ItemRecord], cancel: &CancellationToken) -> Result<BatchSummary> {
        let started_at = Utc::now();
        let ledger = Ledger::load(&self.store, batch).await;
        let mut summary = BatchSummary { total: items.len(), ..BatchSummary::default() };

        let mut pending = Vec::new();
        for (position, item) in items.iter().enumerate() {
            let descriptor = item.descriptor(&self.download_path, batch, position);
            let on_disk = verified_on_disk(&descriptor.destination).await;

            if on_disk {
                if !ledger.is_complete(&item.id) {
                    debug!(id = %item.id, "adopting finished file missing from ledger");
                    if let Err(err) = Ledger::mark_complete(&self.store, batch, &item.id).await {
                        warn!(id = %item.id, error = %err, "failed to record finished file");
                    }
                }
                summary.already_complete += 1;
                continue;
            }
            if ledger.is_complete(&item.id) {
                warn!(
                    id = %item.id,
                    path = %descriptor.destination.display(),
                    "ledger lists item but file is missing, fetching again"
                );
            }
            pending.push((item.title.clone(), descriptor));
        }

        info!(
            batch,
            total = summary.total,
            already_complete = summary.already_complete,
            pending = pending.len(),
            "starting batch"
        );
        self.progress.start_batch(batch, pending.len() as u64);

        let (completed_tx, completed_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(record_completions(Arc::clone(&self.store), batch.to_string(), completed_rx));

        let run = self
            .pool
            .run(pending, cancel, |(title, descriptor)| {
                let transfer = Arc::clone(&self.transfer);
                let progress = self.progress.clone();
                let completed_tx = completed_tx.clone();
                let cancel = cancel.clone();
                async move {
                    let outcome = dispatch(transfer.as_ref(), &descriptor, &cancel).await;
                    if outcome.is_success() && completed_tx.send(descriptor.id.clone()).is_err() {
                        error!(id = %descriptor.id, "ledger writer stopped early");
                    }
                    if !matches!(outcome, Outcome::Failed(DownloadError::Cancelled)) {
                        progress.item_finished(outcome.is_success());
                    }
                    (title, descriptor, outcome)
                }
            })
            .await;
        drop(completed_tx);

        match writer.await {
            Ok(0) => {}
            Ok(failed_writes) => warn!(batch, failed_writes, "some completions were not recorded"),
            Err(err) => error!(batch, error = %err, "ledger writer did not complete"),
        }

        for (title, descriptor, outcome) in run.finished {
            match outcome {
                Outcome::Success(_) => summary.succeeded += 1,
                Outcome::Failed(DownloadError::Cancelled) => summary.cancelled += 1,
                Outcome::Failed(err) => {
                    summary.failed += 1;
                    summary.failures.push(ItemFailure { id: descriptor.id, title, cause: err.to_string() });
                }
            }
        }
        summary.cancelled += run.skipped.len();
        summary.failed += run.panicked;
        summary.failures.sort_by(|a, b| a.id.cmp(&b.id));
        self.progress.finish_batch();

        let last_run = LastRun { started_at, finished_at: Utc::now(), summary: summary.clone() };
        if let Err(err) = self.store.set(&Self::last_run_key(batch), &last_run).await {
            warn!(batch, error = %err, "failed to record last run");
        }

        info!(
            batch,
            total = summary.total,
            already_complete = summary.already_complete,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "batch finished"
        );
        Ok(summary)
    }
}

async fn dispatch(transfer: &dyn Transfer, descriptor: &TransferDescriptor, cancel: &CancellationToken) -> Outcome {
    debug!(id = %descriptor.id, path = %descriptor.destination.display(), "dispatching item");
    let outcome = transfer.transfer(descriptor, cancel).await;
    match &outcome {
        Outcome::Success(report) => {
            info!(id = %descriptor.id, strategy = ?report.strategy, bytes = report.bytes, "item complete")
        }
        Outcome::Failed(DownloadError::Cancelled) => debug!(id = %descriptor.id, "item cancelled"),
        Outcome::Failed(err) => error!(id = %descriptor.id, error = %err, "item failed"),
    }
    outcome
}

/// Single writer for the batch ledger. Returns the number of failed writes.
async fn record_completions(store: Arc<StateStore>, batch: String, mut completed: mpsc::UnboundedReceiver<String>) -> usize {
    let mut failed_writes = 0;
    while let Some(id) = completed.recv().await {
        if let Err(err) = Ledger::mark_complete(&store, &batch, &id).await {
            error!(batch = %batch, id = %id, error = %err, "failed to record completion");
            failed_writes += 1;
        }
    }
    failed_writes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::search::{ProgressiveSource, StreamDescriptor, TransferStrategySelector};
    use crate::download::testing::{pattern, FakeSource};
    use crate::download::video::buffer::BufferPool;
    use crate::options::Options;
    use std::path::Path;
    use std::time::Duration;
    use url::Url;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        source: Arc<FakeSource>,
        store: Arc<StateStore>,
        orchestrator: Orchestrator,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let options = Options {
            chunk_size: 20_000,
            max_chunk_workers: 3,
            max_item_workers: 2,
            retry_delay: Duration::from_millis(1),
            download_path: root.clone(),
            ..Options::default()
        };
        let source = FakeSource::new();
        let store = Arc::new(StateStore::open(root.join(".cache")).await.unwrap());
        let selector = TransferStrategySelector::new(
            Arc::clone(&source) as Arc<dyn crate::download::RangeSource>,
            &options,
            BufferPool::new(8 * 1024, 8),
            Progress::hidden(),
        );
        let orchestrator = Orchestrator::new(
            Arc::new(selector),
            Arc::clone(&store),
            options.max_item_workers,
            Progress::hidden(),
            root.clone(),
        );
        Fixture { _dir: dir, root, source, store, orchestrator }
    }

    fn item(n: u32) -> ItemRecord {
        ItemRecord {
            id: format!("ep-{n}"),
            title: format!("Episode {n}"),
            number: Some(n),
            stream: StreamDescriptor::Progressive {
                sources: vec![ProgressiveSource { url: url(n), quality: "720p".to_string() }],
            },
            fallbacks: vec![],
            size: None,
            output: None,
        }
    }

    fn url(n: u32) -> Url {
        Url::parse(&format!("https://cdn.test/ep-{n}.mp4")).unwrap()
    }

    fn destination(root: &Path, n: u32) -> PathBuf {
        root.join("course").join(format!("{n:02}-Episode {n}.mp4"))
    }

    #[tokio::test]
    async fn downloads_example_item_and_records_it() {
        let f = fixture().await;
        f.source.insert(&url(1), pattern(45_000));

        let summary = f.orchestrator.run("course", &[item(1)], &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(std::fs::metadata(destination(&f.root, 1)).unwrap().len(), 45_000);
        for start in [0, 20_000, 40_000] {
            assert_eq!(f.source.attempts(&url(1), start), 1);
        }
        assert!(Ledger::load(&f.store, "course").await.is_complete("ep-1"));

        let last_run: serde_json::Value = f.store.get("last_run_course").await.unwrap().unwrap();
        assert_eq!(last_run["summary"]["succeeded"], 1);
    }

    #[tokio::test]
    async fn completed_items_issue_no_requests() {
        let f = fixture().await;
        for n in 1..=3 {
            f.source.insert(&url(n), pattern(30_000));
        }
        let items = (1..=3).map(item).collect::<Vec<_>>();
        let cancel = CancellationToken::new();

        let first = f.orchestrator.run("course", &items, &cancel).await.unwrap();
        assert_eq!(first.succeeded, 3);
        let requests = f.source.requests();

        let second = f.orchestrator.run("course", &items, &cancel).await.unwrap();
        assert_eq!(second.already_complete, 3);
        assert_eq!(second.succeeded, 0);
        assert_eq!(f.source.requests(), requests);
    }

    #[tokio::test]
    async fn missing_file_overrides_ledger() {
        let f = fixture().await;
        f.source.insert(&url(1), pattern(30_000));
        Ledger::mark_complete(&f.store, "course", "ep-1").await.unwrap();

        let summary = f.orchestrator.run("course", &[item(1)], &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.already_complete, 0);
        assert_eq!(summary.succeeded, 1);
        assert!(f.source.requests() > 0);
        assert_eq!(std::fs::read(destination(&f.root, 1)).unwrap(), pattern(30_000));
    }

    #[tokio::test]
    async fn finished_file_is_adopted_into_ledger() {
        let f = fixture().await;
        let path = destination(&f.root, 1);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"already here").unwrap();

        let summary = f.orchestrator.run("course", &[item(1)], &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.already_complete, 1);
        assert_eq!(f.source.requests(), 0);
        assert!(Ledger::load(&f.store, "course").await.is_complete("ep-1"));
    }

    #[tokio::test]
    async fn failed_item_does_not_stop_siblings() {
        let f = fixture().await;
        for n in 1..=5 {
            f.source.insert(&url(n), pattern(25_000));
        }
        f.source.fail_always(&url(3));
        let items = (1..=5).map(item).collect::<Vec<_>>();

        let summary = f.orchestrator.run("course", &items, &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 1);
        assert!(summary.has_failures());
        assert_eq!(summary.failures[0].id, "ep-3");
        assert!(summary.failures[0].cause.contains("chunks failed"));

        let ledger = Ledger::load(&f.store, "course").await;
        assert!(!ledger.is_complete("ep-3"));
        assert_eq!(ledger.completed_ids.len(), 4);
        assert!(!destination(&f.root, 3).exists());
        for n in [1, 2, 4, 5] {
            assert_eq!(std::fs::metadata(destination(&f.root, n)).unwrap().len(), 25_000);
        }
    }

    #[tokio::test]
    async fn cancelled_batch_marks_nothing_complete() {
        let f = fixture().await;
        for n in 1..=4 {
            f.source.insert(&url(n), pattern(25_000));
        }
        f.source.set_delay(Duration::from_secs(30));
        let items = (1..=4).map(item).collect::<Vec<_>>();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let summary = f.orchestrator.run("course", &items, &cancel).await.unwrap();

        assert_eq!(summary.cancelled, 4);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed, 0);
        assert!(Ledger::load(&f.store, "course").await.completed_ids.is_empty());
    }
}
