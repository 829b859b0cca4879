//! Bounded worker pool

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Runs batches of futures with at most `size` in flight
#[derive(Clone, Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool; a size of zero is raised to one
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a running job
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run every job and return the outputs in submission order
    pub async fn run_all<I, F, T>(&self, jobs: I) -> Vec<T>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = T>,
    {
        let mut tasks = FuturesUnordered::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let semaphore = self.semaphore.clone();
            tasks.push(async move {
                // The semaphore is never closed
                let _permit = semaphore.acquire_owned().await.ok();
                (index, job.await)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(done) = tasks.next().await {
            results.push(done);
        }
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, output)| output).collect()
    }

    /// Run jobs until `deadline`.
    ///
    /// Outputs stay in submission order; a job still pending or queued at the
    /// deadline is dropped and yields `None`.
    pub async fn run_until<I, F, T>(&self, jobs: I, deadline: Instant) -> Vec<Option<T>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = T>,
    {
        let mut tasks = FuturesUnordered::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let semaphore = self.semaphore.clone();
            tasks.push(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (index, job.await)
            });
        }

        let mut outputs: Vec<Option<T>> = (0..tasks.len()).map(|_| None).collect();
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);
        loop {
            tokio::select! {
                done = tasks.next() => match done {
                    Some((index, output)) => outputs[index] = Some(output),
                    None => break,
                },
                _ = &mut expiry => break,
            }
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..20).map(|i| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                i
            }
        });

        let results = pool.run_all(jobs).await;
        assert_eq!(results, (0..20).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn test_order_preserved_when_completion_differs() {
        let pool = WorkerPool::new(4);
        let jobs = (0..4u64).map(|i| async move {
            tokio::time::sleep(Duration::from_millis(40 - i * 10)).await;
            i
        });
        assert_eq!(pool.run_all(jobs).await, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_keeps_finished_jobs() {
        let pool = WorkerPool::new(2);
        // Each job takes 10s; two run at a time
        let jobs = (0..6u64).map(|i| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            i
        });

        let deadline = Instant::now() + Duration::from_secs(25);
        let outputs = pool.run_until(jobs, deadline).await;

        assert_eq!(outputs, vec![Some(0), Some(1), Some(2), Some(3), None, None]);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_run_until_completes_before_deadline() {
        let pool = WorkerPool::new(3);
        let jobs = (0..5u64).map(|i| async move { i * 2 });
        let deadline = Instant::now() + Duration::from_secs(60);
        let outputs = pool.run_until(jobs, deadline).await;
        assert_eq!(outputs, (0..5u64).map(|i| Some(i * 2)).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_size_raised() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
