use std::{future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinHandle};

/// How a submitted task was executed.
#[derive(Debug)]
pub enum Submitted<T> {
    Spawned(JoinHandle<T>),
    /// The pool was saturated; the task already ran on the submitting task.
    RanOnCaller(T),
}

/// Bounded pool for device conversations, kept apart from the I/O tasks.
///
/// When every slot is busy the task runs on the caller instead of being
/// queued or dropped, which also slows the submitter down.
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

    /// Two workers per available CPU.
    pub fn default_size() -> usize {
        std::thread::available_parallelism().map_or(4, |n| n.get() * 2)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn submit<F>(&self, task: F) -> Submitted<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Submitted::Spawned(tokio::spawn(async move {
                let _permit = permit;
                task.await
            })),
            Err(_) => {
                tracing::debug!(size = self.size, "worker pool saturated, running on caller");
                metrics::counter!("worker_pool_caller_runs_total").increment(1);
                Submitted::RanOnCaller(task.await)
            }
        }
    }
}
