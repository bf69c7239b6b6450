// src/rate_limit.rs
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Caps how many fetches are in flight at once.
///
/// Backed by tokio's semaphore, which hands permits out in FIFO order: a
/// waiting task is admitted as soon as any running task finishes, whichever
/// one that is.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Run `task` once a slot is free; the slot is released when it completes
    /// (or is dropped).
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        // the semaphore is never closed, so acquire only fails in theory
        let _permit = self.permits.acquire().await.ok();
        task.await
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}
