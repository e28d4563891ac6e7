use std::{future::Future, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("meter {serial} busy: lock not acquired within {waited:?}")]
pub struct LockTimeoutError {
    pub serial: String,
    pub waited: Duration,
}

/// One exclusive lock per meter serial.
///
/// Device sessions are stateful, so every multi-step conversation with a
/// meter runs under its lock. Waiters are served in FIFO order. Locks are
/// created on first use and kept for the life of the process.
#[derive(Default)]
pub struct MeterLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MeterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, serial: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(serial) {
            return lock.clone();
        }
        self.locks
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Waits for the meter's lock, runs `action`, releases on every exit path
    /// (including a panic or the returned future being dropped).
    pub async fn with_exclusive<F, Fut, T>(&self, serial: &str, action: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_for(serial);
        let _guard = lock.lock().await;
        action().await
    }

    /// Like [`MeterLocks::with_exclusive`] but gives up after `wait`, in which
    /// case `action` is never run.
    pub async fn try_exclusive<F, Fut, T>(
        &self,
        serial: &str,
        wait: Duration,
        action: F,
    ) -> Result<T, LockTimeoutError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_for(serial);
        let Ok(_guard) = tokio::time::timeout(wait, lock.lock()).await else {
            tracing::debug!(serial, ?wait, "meter lock busy, skipping");
            metrics::counter!("meter_lock_timeouts_total").increment(1);
            return Err(LockTimeoutError {
                serial: serial.to_string(),
                waited: wait,
            });
        };
        Ok(action().await)
    }

    pub fn is_locked(&self, serial: &str) -> bool {
        self.locks
            .get(serial)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
