//! Bounded worker pool with first-error-wins semantics

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

/// Default number of tasks a pool runs at once
pub const DEFAULT_MAX_TASKS: usize = 10;

/// First error raised into a pool
///
/// Latching an error closes the semaphore, so queued tasks that have not
/// started yet never run.
struct ErrorLatch<E> {
    error: Mutex<Option<E>>,
    semaphore: Arc<Semaphore>,
}

impl<E> ErrorLatch<E> {
    fn raise(&self, err: E) {
        let mut slot = self.error.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(err);
            self.semaphore.close();
        }
    }

    fn take(&self) -> Option<E> {
        self.error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn is_raised(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// Runs futures on tokio tasks, at most `max_tasks` at a time
///
/// Every future is spawned immediately but only starts running once it holds
/// a permit. The first error, whether returned by a task, raised with
/// [`raise`](Self::raise) or caused by a task panic, stops the pool from
/// admitting queued work; tasks already running are allowed to finish.
pub struct BoundedWorkerPool<T, E> {
    set: JoinSet<Option<T>>,
    latch: Arc<ErrorLatch<E>>,
}

impl<T, E> BoundedWorkerPool<T, E>
where
    T: Send + 'static,
    E: From<JoinError> + Send + 'static,
{
    pub fn new(max_tasks: usize) -> Self {
        let semaphore = Arc::new(Semaphore::new(max_tasks.max(1)));
        Self {
            set: JoinSet::new(),
            latch: Arc::new(ErrorLatch {
                error: Mutex::new(None),
                semaphore,
            }),
        }
    }

    /// Queue `task`
    pub fn process<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let latch = self.latch.clone();
        self.set.spawn(async move {
            // Hold the permit until the task finishes
            let Ok(_permit) = latch.semaphore.clone().acquire_owned().await else {
                debug!("Skipping queued task after an earlier failure");
                return None;
            };
            match task.await {
                Ok(value) => Some(value),
                Err(err) => {
                    latch.raise(err);
                    None
                }
            }
        });
    }

    /// Record `err` unless an earlier error was already recorded
    pub fn raise(&self, err: E) {
        self.latch.raise(err);
    }

    pub fn has_failed(&self) -> bool {
        self.latch.is_raised()
    }

    /// Number of tasks that have not been joined yet
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for every task to settle
    ///
    /// Returns the outputs of successful tasks in completion order, or the
    /// first error.
    pub async fn wait(self) -> Result<Vec<T>, E> {
        let (outputs, failure) = self.settle().await;
        match failure {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }

    /// Wait for every task to settle, keeping successful outputs even when
    /// the pool failed
    pub async fn settle(mut self) -> (Vec<T>, Option<E>) {
        let mut outputs = Vec::with_capacity(self.set.len());
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "Worker task did not complete");
                    self.latch.raise(E::from(err));
                }
            }
        }
        (outputs, self.latch.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Failed(usize),
        Panicked,
    }

    impl From<JoinError> for TestError {
        fn from(_: JoinError) -> Self {
            TestError::Panicked
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_max_tasks() {
        let running = Arc::new(AtomicUsize::new(0));
        let mut pool: BoundedWorkerPool<usize, TestError> = BoundedWorkerPool::new(3);

        for i in 0..20u64 {
            let running = running.clone();
            pool.process(async move {
                let watermark = running.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(10 + i % 7)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(watermark)
            });
        }

        let watermarks = pool.wait().await.unwrap();
        assert_eq!(watermarks.len(), 20);
        assert!(watermarks.iter().all(|watermark| *watermark <= 3));
    }

    #[tokio::test]
    async fn test_first_error_stops_queued_work() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool: BoundedWorkerPool<(), TestError> = BoundedWorkerPool::new(1);

        pool.process(async { Err(TestError::Failed(1)) });
        for _ in 0..4 {
            let ran = ran.clone();
            pool.process(async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(pool.wait().await, Err(TestError::Failed(1)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_work_settles_and_first_error_wins() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut pool: BoundedWorkerPool<(), TestError> = BoundedWorkerPool::new(2);

        let slow = finished.clone();
        pool.process(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            slow.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Failed(2))
        });
        pool.process(async { Err(TestError::Failed(1)) });

        assert_eq!(pool.wait().await, Err(TestError::Failed(1)));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_raise_latches_only_the_first_error() {
        let mut pool: BoundedWorkerPool<(), TestError> = BoundedWorkerPool::new(4);
        pool.raise(TestError::Failed(1));
        pool.raise(TestError::Failed(2));
        assert!(pool.has_failed());

        pool.process(async { Ok(()) });
        assert_eq!(pool.wait().await, Err(TestError::Failed(1)));
    }

    async fn explode() -> Result<(), TestError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panics_are_reported_as_errors() {
        let mut pool: BoundedWorkerPool<(), TestError> = BoundedWorkerPool::new(2);
        pool.process(explode());
        pool.process(async { Ok(()) });

        assert_eq!(pool.wait().await, Err(TestError::Panicked));
    }

    #[tokio::test]
    async fn test_settle_keeps_outputs_of_tasks_that_finished() {
        let mut pool: BoundedWorkerPool<u32, TestError> = BoundedWorkerPool::new(1);
        pool.process(async { Ok(7) });
        pool.process(async {
            explode().await?;
            Ok(8)
        });

        let (outputs, failure) = pool.settle().await;
        assert_eq!(outputs, vec![7]);
        assert_eq!(failure, Some(TestError::Panicked));
    }

    #[tokio::test]
    async fn test_empty_pool_returns_immediately() {
        let pool: BoundedWorkerPool<u32, TestError> = BoundedWorkerPool::new(0);
        assert!(pool.is_empty());
        assert_eq!(pool.wait().await, Ok(Vec::new()));
    }
}
