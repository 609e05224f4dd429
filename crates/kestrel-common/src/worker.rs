//! Bounded pool for blocking work
//!
//! Certificate generation is CPU-bound and must not run on the async
//! executor. Jobs run on tokio's blocking threads, gated by a semaphore so
//! that at most `size` of them are in flight at once.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::trace;

use crate::{Error, Result};

/// Bounded blocking worker pool
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool running at most `size` jobs concurrently (minimum 1)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Maximum number of concurrent jobs
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on a blocking thread and await its result
    ///
    /// `context` names the job in errors and logs. A panicking job surfaces
    /// as [`Error::Internal`].
    pub async fn run<F, T>(&self, context: &str, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| Error::internal_with_context("worker-pool", e.to_string()))?;

        trace!(job = %context, "dispatching to worker pool");
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| Error::internal_with_context("worker-pool", format!("{}: {}", context, e)))
    }
}
