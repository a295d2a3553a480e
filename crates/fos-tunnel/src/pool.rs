//! Bounded worker pool
//!
//! Proxy startup and the connectivity sub-checks run as tokio tasks gated by
//! a semaphore. Work submitted while every permit is taken waits for one to
//! free up; nothing runs beyond the pool size.
//!
//! Dropping a [`PoolTask`] cancels its work and returns the permit, so a
//! caller that gives up on a result never leaks a worker.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

/// Default number of concurrent units of work
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Three probe checks plus the proxy start of a follow-up attempt
pub const MIN_POOL_SIZE: usize = 4;

/// Fixed-size pool of async workers
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool; sizes below [`MIN_POOL_SIZE`] are raised to it
    pub fn new(size: usize) -> Self {
        if size < MIN_POOL_SIZE {
            warn!("Worker pool size {} too small, using {}", size, MIN_POOL_SIZE);
        }
        let size = size.max(MIN_POOL_SIZE);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Pool size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Units of work that could start right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Submit a unit of work.
    ///
    /// The task waits for a permit before running `work`. Joining a task
    /// whose permit could not be acquired (pool closed) yields `None`.
    pub fn spawn<F>(&self, work: F) -> PoolTask<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("Worker pool closed, dropping task");
                    return None;
                }
            };
            Some(work.await)
        });
        PoolTask { handle }
    }

    /// Stop accepting work; queued tasks resolve to `None`.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Pending unit of work; aborted when dropped
#[derive(Debug)]
pub struct PoolTask<T> {
    handle: JoinHandle<Option<T>>,
}

impl<T> Future for PoolTask<T> {
    type Output = Result<Option<T>, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T> Drop for PoolTask<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}
