//! Bounded worker pool for blocking and long-running work.
//!
//! Request handlers never run Parquet encoding, archive building, file I/O,
//! or model inference on the async executor directly. They hand it to
//! [`WorkerPool`], which caps the number of in-flight jobs with a semaphore
//! and runs blocking closures on tokio's blocking thread pool.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run a blocking closure on the blocking thread pool once a slot is free.
    pub async fn run_blocking<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| anyhow!("worker pool closed"))?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| anyhow!("worker task failed: {}", e))?
    }

    /// Run an async job while holding a slot.
    pub async fn run<Fut, T>(&self, job: Fut) -> Result<T, PoolClosed>
    where
        Fut: Future<Output = T>,
    {
        let _permit = self.permits.acquire().await.map_err(|_| PoolClosed)?;
        Ok(job.await)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("worker pool closed")]
pub struct PoolClosed;
