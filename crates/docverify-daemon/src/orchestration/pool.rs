//! Semaphore-based pool bounding concurrently executing pipelines.
//!
//! The [`PipelinePool`] is the single resource shared by every session: no
//! matter how many sessions ask to be processed, at most `max_concurrency`
//! pipelines hold a permit at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Default maximum number of concurrently executing pipelines.
const DEFAULT_MAX_CONCURRENCY: usize = 2;

/// One pipeline attempt's slot. Released on drop.
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Global concurrency limiter for pipelines.
pub struct PipelinePool {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    running: Arc<AtomicUsize>,
    /// Highest number of permits ever held at the same time.
    peak: AtomicUsize,
}

impl PipelinePool {
    /// Pool of `max_concurrency` slots; zero falls back to the default.
    pub fn new(max_concurrency: usize) -> Self {
        let limit = if max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            max_concurrency
        };

        info!(max_pipelines = limit, "Pipeline pool ready");

        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            max_concurrency: limit,
            running: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    fn issue(&self, permit: OwnedSemaphorePermit) -> PoolPermit {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        debug!(running = now, max = self.max_concurrency, "Pipeline permit issued");
        PoolPermit {
            _permit: permit,
            running: Arc::clone(&self.running),
        }
    }

    /// Acquire a permit if one is free right now.
    pub fn try_acquire(&self) -> Option<PoolPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(self.issue(permit))
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<PoolPermit, PoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(self.issue(permit))
    }

    /// Stop issuing permits; pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Free slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of permits held simultaneously since creation.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Default for PipelinePool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pipeline pool has been closed")]
    Closed,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_pool_allows_two_pipelines() {
        let pool = PipelinePool::default();
        assert_eq!(pool.max_concurrency(), DEFAULT_MAX_CONCURRENCY);
        assert_eq!(pool.available_permits(), DEFAULT_MAX_CONCURRENCY);
    }

    #[tokio::test]
    async fn zero_limit_falls_back_to_default() {
        let pool = PipelinePool::new(0);
        assert_eq!(pool.max_concurrency(), DEFAULT_MAX_CONCURRENCY);
    }

    #[tokio::test]
    #[allow(clippy::significant_drop_tightening)]
    async fn try_acquire_respects_limit() {
        let pool = PipelinePool::new(2);
        let permit1 = pool.try_acquire();
        let permit2 = pool.try_acquire();
        assert!(permit1.is_some() && permit2.is_some());
        assert_eq!(pool.running(), 2);
        assert!(pool.try_acquire().is_none());
        drop((permit1, permit2));
        assert_eq!(pool.running(), 0);
        assert_eq!(pool.peak(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_permit() {
        let pool = Arc::new(PipelinePool::new(1));
        let permit = pool.try_acquire().unwrap();

        let pool_clone = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            pool_clone.acquire().await.unwrap();
        });

        drop(permit);

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter wakes once the slot is released")
            .unwrap();
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let pool = PipelinePool::new(1);
        pool.close();
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }
}
