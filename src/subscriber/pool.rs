//! Bounded pool for running handler bodies.
//!
//! Handlers are synchronous user code, so each job runs on tokio's blocking
//! thread pool. A semaphore caps how many run at once across every
//! consumption loop. A job that outlives its wait keeps running in the
//! background and keeps its permit until it returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::utils::PoolError;

#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: u32,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize)) as u32;
        Self {
            permits: Arc::new(Semaphore::new(size as usize)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Jobs currently holding a worker.
    pub fn in_flight(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.size as usize - self.permits.available_permits()
    }

    /// Run `job` on a worker and wait up to `wait` for its result, time
    /// spent queueing for a free worker included.
    pub async fn execute<F, T>(&self, job: F, wait: Duration) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let run = async {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| PoolError::ShutDown)?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job()
            })
            .await
            .map_err(|err| PoolError::Panicked(err.to_string()))
        };

        tokio::time::timeout(wait, run)
            .await
            .map_err(|_| PoolError::TimedOut(wait))?
    }

    /// Refuse new jobs once every running job has returned its worker.
    pub async fn shutdown(&self) {
        if let Ok(all) = self.permits.acquire_many(self.size).await {
            all.forget();
        }
        self.permits.close();
    }
}
