//! Wiring of the communications core from configuration.

use std::{sync::Arc, time::Duration};

use profile_store::{MemoryProfileStore, PgProfileStore, ProfileStore};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{broadcast::error::RecvError, watch};

use crate::{
    config::{AppConfig, StoreConfig},
    correlation::CorrelationTracker,
    cursor::CursorResolver,
    device::{BlockSalvage, DeviceCodec, MultiplexedDevice},
    meter_lock::MeterLocks,
    registry::{BroadcastStatusSink, ConnectionRegistry},
    scheduler::SyncScheduler,
    server::HeadEndServer,
    sync::{PrometheusSyncMetrics, ProfileSyncEngine},
    worker::WorkerPool,
};

pub async fn connect_store(cfg: &StoreConfig) -> anyhow::Result<Arc<dyn ProfileStore>> {
    match cfg {
        StoreConfig::Memory => {
            tracing::warn!("using in-memory profile store; data is lost on restart");
            Ok(Arc::new(MemoryProfileStore::new()))
        }
        StoreConfig::Postgres {
            uri,
            max_connections,
            max_retries,
            retry_backoff_ms,
        } => {
            let pool = PgPoolOptions::new()
                .max_connections(*max_connections)
                .connect(uri)
                .await?;
            let store = PgProfileStore::new(pool, *max_retries, Duration::from_millis(*retry_backoff_ms));
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Everything the head-end shares between the listener and the workers.
pub struct HeadEnd {
    cfg: AppConfig,
    pub status: Arc<BroadcastStatusSink>,
    pub registry: Arc<ConnectionRegistry>,
    pub tracker: Arc<CorrelationTracker>,
    pub locks: Arc<MeterLocks>,
    pub store: Arc<dyn ProfileStore>,
    /// Present only when a device codec was supplied.
    pub sync: Option<Arc<ProfileSyncEngine>>,
}

impl HeadEnd {
    pub fn new(cfg: AppConfig, store: Arc<dyn ProfileStore>, codec: Option<Arc<dyn DeviceCodec>>) -> Self {
        let status = Arc::new(BroadcastStatusSink::new(cfg.listener.status_channel_capacity));
        let registry = Arc::new(ConnectionRegistry::new(status.clone(), cfg.listener.frame_history));
        let tracker = Arc::new(CorrelationTracker::new(registry.clone()));
        let locks = Arc::new(MeterLocks::new());

        let sync = codec.map(|codec| {
            let salvage = Arc::new(BlockSalvage::new());
            let device = Arc::new(MultiplexedDevice::new(
                tracker.clone(),
                registry.clone(),
                codec,
                salvage.clone(),
                cfg.correlation.request_timeout(),
                cfg.sync.max_blocks,
            ));
            let resolver = Arc::new(CursorResolver::new(store.clone(), device.clone()));
            Arc::new(ProfileSyncEngine::new(
                locks.clone(),
                resolver,
                device,
                salvage,
                store.clone(),
                Arc::new(PrometheusSyncMetrics),
                cfg.sync.settings(),
            ))
        });

        Self {
            cfg,
            status,
            registry,
            tracker,
            locks,
            store,
            sync,
        }
    }

    /// Runs listener, housekeeping and scheduler until `shutdown` flips.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        spawn_status_log(&self.status, shutdown.clone());
        spawn_purge(self.tracker.clone(), self.cfg.correlation.purge_interval(), shutdown.clone());

        let scheduler = match &self.sync {
            Some(engine) if self.cfg.sync.enabled => {
                let workers = self.cfg.sync.workers.unwrap_or_else(WorkerPool::default_size);
                tracing::info!(
                    workers,
                    profiles = self.cfg.sync.profiles.len(),
                    interval_secs = self.cfg.sync.interval_secs,
                    "profile sync scheduler enabled"
                );
                let scheduler = SyncScheduler::new(
                    engine.clone(),
                    self.registry.clone(),
                    Arc::new(WorkerPool::new(workers)),
                    self.cfg.sync.profiles.clone(),
                    self.cfg.sync.default_model.clone(),
                    self.cfg.sync.lock_wait(),
                );
                Some(scheduler.spawn(self.cfg.sync.interval(), shutdown.clone()))
            }
            Some(_) => {
                tracing::info!("profile sync disabled by configuration");
                None
            }
            None => {
                tracing::info!("no device codec installed; profile sync disabled");
                None
            }
        };

        let server = HeadEndServer::bind(&self.cfg.listener, self.registry.clone(), self.tracker.clone()).await?;
        server.run(shutdown).await?;

        if let Some(handle) = scheduler {
            let _ = handle.await;
        }
        Ok(())
    }
}

fn spawn_status_log(status: &BroadcastStatusSink, mut shutdown: watch::Receiver<bool>) {
    let mut events = status.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(e) => tracing::info!(serial = %e.meter_serial, status = ?e.status, at = %e.at, "meter status"),
                    Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "status log lagging"),
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    });
}

fn spawn_purge(tracker: Arc<CorrelationTracker>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = tracker.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, "purged abandoned correlation entries");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}
