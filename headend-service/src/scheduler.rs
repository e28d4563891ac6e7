use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle};

use crate::{
    config::ProfileConfig,
    registry::ConnectionRegistry,
    sync::{ProfileSyncEngine, SyncError},
    worker::{Submitted, WorkerPool},
};

/// Periodic best-effort sync of every configured profile on every online meter.
pub struct SyncScheduler {
    engine: Arc<ProfileSyncEngine>,
    registry: Arc<ConnectionRegistry>,
    pool: Arc<WorkerPool>,
    profiles: Vec<ProfileConfig>,
    model: String,
    lock_wait: Duration,
}

/// Counts from one scheduler tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub submitted: usize,
    pub ran_on_caller: usize,
}

impl SyncScheduler {
    pub fn new(
        engine: Arc<ProfileSyncEngine>,
        registry: Arc<ConnectionRegistry>,
        pool: Arc<WorkerPool>,
        profiles: Vec<ProfileConfig>,
        model: String,
        lock_wait: Duration,
    ) -> Self {
        Self {
            engine,
            registry,
            pool,
            profiles,
            model,
            lock_wait,
        }
    }

    /// Hands one sync per (online meter, profile) to the worker pool.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        for serial in self.registry.online_serials() {
            for profile in &self.profiles {
                let engine = self.engine.clone();
                let model = self.model.clone();
                let serial = serial.clone();
                let obis = profile.obis;
                let batch_size = profile.batch_size;
                let lock_wait = self.lock_wait;

                let job = async move {
                    match engine
                        .try_sync_up_to_now(&model, &serial, &obis, batch_size, lock_wait)
                        .await
                    {
                        Ok(_) => {}
                        Err(SyncError::LockTimeout(_)) => {
                            tracing::debug!(serial = %serial, %obis, "meter busy, retrying next tick");
                        }
                        // Already logged and counted by the engine.
                        Err(_) => {}
                    }
                };

                summary.submitted += 1;
                if let Submitted::RanOnCaller(()) = self.pool.submit(job).await {
                    summary.ran_on_caller += 1;
                }
            }
        }
        summary
    }

    pub fn spawn(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = self.tick().await;
                        if summary.submitted > 0 {
                            tracing::debug!(submitted = summary.submitted, ran_on_caller = summary.ran_on_caller, "sync tick");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::info!("sync scheduler stopped");
        })
    }
}
