//! Fixed-size background worker pool
//!
//! Engine start and teardown run here so that connect and disconnect never
//! wait on collaborator I/O. One pool exists per session and is shut down
//! with a bounded wait once the session is torn down.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{Error, Result};

/// How a pool shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolShutdown {
    /// Every task finished within the graceful wait
    Drained,
    /// Remaining tasks were cancelled and finished within the forced wait
    Cancelled,
    /// Cancelled tasks were still running when the forced wait expired
    Abandoned,
}

/// Runs at most `workers` tasks at a time
pub struct WorkerPool {
    tasks: Mutex<Option<JoinSet<()>>>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            tasks: Mutex::new(Some(JoinSet::new())),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Queue a task; returns false once the pool is shut down
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(set) = tasks.as_mut() else {
            log::warn!("Worker pool is shut down; task dropped");
            return false;
        };

        let permits = self.permits.clone();
        set.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });
        true
    }

    /// Number of queued or running tasks
    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, JoinSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting tasks and wait for the queued ones
    ///
    /// Waits `grace` for the tasks to finish, then cancels them and waits a
    /// further `force`. If `interrupt` resolves first, remaining tasks are
    /// cancelled at once and [`Error::TeardownInterrupted`] is returned.
    pub async fn shutdown<I>(&self, grace: Duration, force: Duration, interrupt: I) -> Result<PoolShutdown>
    where
        I: Future<Output = ()>,
    {
        let taken = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut tasks) = taken else {
            return Ok(PoolShutdown::Drained);
        };
        tokio::pin!(interrupt);

        let drained = tokio::select! {
            result = tokio::time::timeout(grace, drain(&mut tasks)) => Some(result.is_ok()),
            _ = &mut interrupt => None,
        };

        match drained {
            Some(true) => return Ok(PoolShutdown::Drained),
            Some(false) => {
                log::warn!(
                    "Worker pool did not finish within {:?}; cancelling {} task(s)",
                    grace,
                    tasks.len()
                );
                tasks.abort_all();
            }
            None => {
                log::warn!("Teardown interrupted; cancelling {} task(s)", tasks.len());
                tasks.abort_all();
                let _ = tokio::time::timeout(force, drain(&mut tasks)).await;
                return Err(Error::TeardownInterrupted);
            }
        }

        let finished = tokio::select! {
            result = tokio::time::timeout(force, drain(&mut tasks)) => Some(result.is_ok()),
            _ = &mut interrupt => None,
        };

        match finished {
            Some(true) => Ok(PoolShutdown::Cancelled),
            Some(false) => {
                log::error!("Worker pool did not terminate after cancellation");
                Ok(PoolShutdown::Abandoned)
            }
            None => Err(Error::TeardownInterrupted),
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                log::error!("Background task panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_drains_gracefully() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = done.clone();
            assert!(pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let outcome = pool
            .shutdown(Duration::from_secs(2), Duration::from_secs(1), std::future::pending())
            .await
            .unwrap();
        assert_eq!(outcome, PoolShutdown::Drained);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(!pool.spawn(async {}));
    }

    #[tokio::test]
    async fn test_cancels_after_grace() {
        let pool = WorkerPool::new(1);
        pool.spawn(std::future::pending());

        let outcome = pool
            .shutdown(Duration::from_millis(20), Duration::from_millis(200), std::future::pending())
            .await
            .unwrap();
        assert_eq!(outcome, PoolShutdown::Cancelled);
    }

    #[tokio::test]
    async fn test_interrupt() {
        let pool = WorkerPool::new(2);
        pool.spawn(std::future::pending());

        let result = pool
            .shutdown(Duration::from_secs(5), Duration::from_secs(1), async {})
            .await;
        assert!(matches!(result, Err(Error::TeardownInterrupted)));
    }

    #[tokio::test]
    async fn test_limits_concurrency() {
        let pool = WorkerPool::new(1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let active = active.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }

        pool.shutdown(Duration::from_secs(2), Duration::from_secs(1), std::future::pending())
            .await
            .unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
