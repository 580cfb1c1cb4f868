//! Bounded worker pools
//!
//! Two pools run component triggers: the timer pool for timer, cron, and
//! primary-only strategies, the event pool for event-driven components.
//! Each bounds concurrency with semaphore permits, supports dynamic resize,
//! and shuts down either gracefully (drain within a budget) or forcefully
//! (abort outstanding work).

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A bounded pool of trigger workers.
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    size: AtomicUsize,
    tracker: TaskTracker,
    cancel: CancellationToken,
    aborts: Mutex<Vec<AbortHandle>>,
}

impl WorkerPool {
    /// Create a pool bounded at `size` concurrent tasks.
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(size)),
            size: AtomicUsize::new(size),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            aborts: Mutex::new(Vec::new()),
        }
    }

    /// Pool name, for logging.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current concurrency bound.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Resize the pool. Growing takes effect immediately; shrinking takes
    /// effect as running tasks release their permits.
    pub fn set_size(&self, new_size: usize) {
        let old = self.size.swap(new_size, Ordering::SeqCst);
        if new_size > old {
            self.permits.add_permits(new_size - old);
        } else if new_size < old {
            let remove = old - new_size;
            let permits = self.permits.clone();
            let cancel = self.cancel.child_token();
            self.tracker.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    taken = permits.acquire_many(remove as u32) => {
                        if let Ok(taken) = taken {
                            taken.forget();
                        }
                    }
                }
            });
        }
        tracing::debug!(pool = self.name, old, new = new_size, "Resized worker pool");
    }

    /// Whether shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one task on the pool, waiting for a permit. Returns false when
    /// the pool is shutting down and the task was not dispatched.
    pub async fn execute<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return false;
        }
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
            _ = self.cancel.cancelled() => return false,
        };
        let handle = self.tracker.spawn(async move {
            task.await;
            drop(permit);
        });
        let mut aborts = self.aborts.lock();
        aborts.retain(|h| !h.is_finished());
        aborts.push(handle.abort_handle());
        true
    }

    /// Spawn a long-lived worker loop tracked by the pool but not counted
    /// against the permit bound. The loop receives the pool's cancellation
    /// token and must exit when it fires.
    pub fn spawn_worker<F, Fut>(&self, worker: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tracker.spawn(worker(self.cancel.child_token()));
        let mut aborts = self.aborts.lock();
        aborts.retain(|h| !h.is_finished());
        aborts.push(handle.abort_handle());
    }

    /// Acquire one execution permit directly; used by worker loops to bound
    /// their own concurrency. Returns `None` during shutdown.
    pub async fn acquire(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok(),
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Shut the pool down.
    ///
    /// Graceful shutdown waits up to `drain_budget` for outstanding tasks;
    /// forced shutdown aborts them. Returns true when the pool drained
    /// cleanly within the budget.
    pub async fn shutdown(&self, drain_budget: Duration, kill: bool) -> bool {
        self.cancel.cancel();
        self.tracker.close();

        if kill {
            for handle in self.aborts.lock().drain(..) {
                handle.abort();
            }
        }

        match tokio::time::timeout(drain_budget, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    pool = self.name,
                    budget_ms = drain_budget.as_millis() as u64,
                    "Worker pool did not drain within the shutdown budget"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_execute_bounded_by_permits() {
        let pool = Arc::new(WorkerPool::new("test", 2));
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let peak = peak.clone();
            let running = running.clone();
            pool.execute(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }

        assert!(pool.shutdown(Duration::from_secs(2), false).await);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_times_out() {
        let pool = WorkerPool::new("test", 1);
        pool.execute(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .await;
        let clean = pool.shutdown(Duration::from_millis(50), false).await;
        assert!(!clean);
    }

    #[tokio::test]
    async fn test_kill_aborts_wedged_worker() {
        let pool = WorkerPool::new("test", 1);
        pool.execute(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
        .await;
        let clean = pool.shutdown(Duration::from_secs(1), true).await;
        assert!(clean);
    }

    #[tokio::test]
    async fn test_execute_refused_after_shutdown() {
        let pool = WorkerPool::new("test", 1);
        pool.shutdown(Duration::from_millis(10), false).await;
        assert!(!pool.execute(async {}).await);
    }
}
