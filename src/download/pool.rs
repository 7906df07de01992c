use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Fixed-width task pool. A job is only spawned once it holds one of the
/// `width` permits, so at most `width` jobs exist at any time.
#[derive(Debug, Clone, Copy)]
pub struct BoundedPool {
    width: usize,
}

#[derive(Debug)]
pub struct PoolRun<J, T> {
    /// Results in completion order.
    pub finished: Vec<T>,
    /// Jobs that were never started because cancellation fired first.
    pub skipped: Vec<J>,
    pub panicked: usize,
}

impl BoundedPool {
    pub fn new(width: usize) -> Self {
        Self { width: width.max(1) }
    }

    pub async fn run<J, T, F, Fut>(
        &self,
        jobs: impl IntoIterator<Item = J>,
        cancel: &CancellationToken,
        work: F,
    ) -> PoolRun<J, T>
    where
        J: Send + 'static,
        T: Send + 'static,
        F: Fn(J) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.width));
        let mut tasks = JoinSet::new();
        let mut skipped = Vec::new();
        let mut jobs = jobs.into_iter();

        while let Some(job) = jobs.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };

            let Some(permit) = permit else {
                skipped.push(job);
                skipped.extend(jobs.by_ref());
                break;
            };

            let task = work(job);
            tasks.spawn(async move {
                let _permit = permit;
                task.await
            });
        }

        let mut finished = Vec::with_capacity(tasks.len());
        let mut panicked = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(value) => finished.push(value),
                Err(err) => {
                    error!(error = %err, "pool task did not complete");
                    panicked += 1;
                }
            }
        }

        PoolRun { finished, skipped, panicked }
    }
}
