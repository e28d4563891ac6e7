//! Incremental load-profile synchronisation.
//!
//! One run walks RESOLVE_CURSOR -> READ_BATCH -> PERSIST_BATCH ->
//! ADVANCE_CURSOR until the device has nothing newer or a budget runs out. A
//! failed read goes through RECOVER_PARTIAL: completed rows are persisted
//! before the failure is reported.

pub mod metrics;

use std::{sync::Arc, time::Duration};

use profile_store::{CapturePeriod, ObisCode, ProfileRow, ProfileStore, ScalerTable, StoreError};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::{
    cursor::{CursorError, CursorResolver},
    device::{DeviceError, PartialRecovery, ProfileDevice},
    meter_lock::{LockTimeoutError, MeterLocks},
};
pub use self::metrics::{PrometheusSyncMetrics, SyncMetrics};

/// Gap between the last persisted timestamp and the start of the next read.
pub const READ_EPSILON: time::Duration = time::Duration::SECOND;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Read window used while the device's capture period is unknown.
    pub unknown_period_window: Duration,
    pub max_rows_per_run: usize,
    pub max_run_time: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            unknown_period_window: Duration::from_secs(24 * 3600),
            max_rows_per_run: 10_000,
            max_run_time: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Read up to the current time.
    UpToDate,
    RowBudget,
    TimeBudget,
    /// Neither the store nor the device holds any entry for the profile.
    NoHistory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Rows that did not exist in the store before this run.
    pub rows_saved: usize,
    pub batches: u32,
    pub cursor: Option<OffsetDateTime>,
    pub stop: StopReason,
}

impl SyncOutcome {
    /// Nothing new was found and nothing is left to read.
    pub fn already_current(&self) -> bool {
        self.rows_saved == 0 && matches!(self.stop, StopReason::UpToDate | StopReason::NoHistory)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SyncCause {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CursorError> for SyncCause {
    fn from(e: CursorError) -> Self {
        match e {
            CursorError::Store(e) => Self::Store(e),
            CursorError::Device(e) => Self::Device(e),
        }
    }
}

impl SyncCause {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Device(e) => e.cause(),
            Self::Store(_) => "store",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    LockTimeout(#[from] LockTimeoutError),
    #[error("sync of {obis} on meter {serial} failed after saving {rows_saved} rows up to {cursor}: {source}")]
    PartialRead {
        serial: String,
        obis: ObisCode,
        rows_saved: usize,
        cursor: OffsetDateTime,
        source: SyncCause,
    },
    #[error("sync of {obis} on meter {serial} failed: {source}")]
    Failed {
        serial: String,
        obis: ObisCode,
        source: SyncCause,
    },
}

impl SyncError {
    /// Whether the durable cursor moved before the failure.
    pub fn made_progress(&self) -> bool {
        matches!(self, Self::PartialRead { .. })
    }

    pub fn cause(&self) -> &'static str {
        match self {
            Self::LockTimeout(_) => "lock_timeout",
            Self::PartialRead { source, .. } | Self::Failed { source, .. } => source.label(),
        }
    }
}

/// Where a run currently is.
enum Step {
    ReadBatch,
    PersistBatch { rows: Vec<ProfileRow>, to: OffsetDateTime, now: OffsetDateTime },
    RecoverPartial { error: DeviceError, to: OffsetDateTime },
    Done(StopReason),
}

/// Per-run bookkeeping.
struct Run<'a> {
    model: &'a str,
    serial: &'a str,
    obis: &'a ObisCode,
    period: CapturePeriod,
    scalers: ScalerTable,
    cursor: OffsetDateTime,
    rows_read: usize,
    rows_saved: usize,
    batches: u32,
}

impl Run<'_> {
    fn error(&self, source: SyncCause) -> SyncError {
        if self.batches > 0 {
            SyncError::PartialRead {
                serial: self.serial.to_string(),
                obis: *self.obis,
                rows_saved: self.rows_saved,
                cursor: self.cursor,
                source,
            }
        } else {
            SyncError::Failed {
                serial: self.serial.to_string(),
                obis: *self.obis,
                source,
            }
        }
    }

    fn outcome(&self, stop: StopReason) -> SyncOutcome {
        SyncOutcome {
            rows_saved: self.rows_saved,
            batches: self.batches,
            cursor: Some(self.cursor),
            stop,
        }
    }
}

/// Rows strictly after the cursor and no later than `to`, in timestamp order
/// with duplicates removed.
fn fresh_rows(mut rows: Vec<ProfileRow>, cursor: OffsetDateTime, to: OffsetDateTime) -> Vec<ProfileRow> {
    rows.retain(|r| r.timestamp > cursor && r.timestamp <= to);
    rows.sort_by_key(|r| r.timestamp);
    rows.dedup_by_key(|r| r.timestamp);
    rows
}

fn read_window(period: CapturePeriod, batch_size: usize, fallback: Duration) -> time::Duration {
    let seconds = match period.seconds() {
        Some(s) => i64::from(s).saturating_mul(i64::try_from(batch_size.max(1)).unwrap_or(i64::MAX)),
        None => i64::try_from(fallback.as_secs()).unwrap_or(i64::MAX),
    };
    time::Duration::seconds(seconds.max(1))
}

pub struct ProfileSyncEngine {
    locks: Arc<MeterLocks>,
    resolver: Arc<CursorResolver>,
    device: Arc<dyn ProfileDevice>,
    recovery: Arc<dyn PartialRecovery>,
    store: Arc<dyn ProfileStore>,
    metrics: Arc<dyn SyncMetrics>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
}

impl ProfileSyncEngine {
    pub fn new(
        locks: Arc<MeterLocks>,
        resolver: Arc<CursorResolver>,
        device: Arc<dyn ProfileDevice>,
        recovery: Arc<dyn PartialRecovery>,
        store: Arc<dyn ProfileStore>,
        metrics: Arc<dyn SyncMetrics>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            locks,
            resolver,
            device,
            recovery,
            store,
            metrics,
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn resolver(&self) -> &Arc<CursorResolver> {
        &self.resolver
    }

    /// Reads everything the device captured since the stored cursor and
    /// persists it, holding the meter's lock for the whole run.
    pub async fn sync_up_to_now(
        &self,
        model: &str,
        serial: &str,
        obis: &ObisCode,
        batch_size: usize,
    ) -> Result<SyncOutcome, SyncError> {
        self.locks
            .with_exclusive(serial, || self.run(model, serial, obis, batch_size))
            .await
    }

    /// Like [`ProfileSyncEngine::sync_up_to_now`] but gives up with
    /// [`SyncError::LockTimeout`] if the meter stays busy for `lock_wait`.
    pub async fn try_sync_up_to_now(
        &self,
        model: &str,
        serial: &str,
        obis: &ObisCode,
        batch_size: usize,
        lock_wait: Duration,
    ) -> Result<SyncOutcome, SyncError> {
        self.locks
            .try_exclusive(serial, lock_wait, || self.run(model, serial, obis, batch_size))
            .await?
    }

    async fn run(
        &self,
        model: &str,
        serial: &str,
        obis: &ObisCode,
        batch_size: usize,
    ) -> Result<SyncOutcome, SyncError> {
        let started = Instant::now();
        let result = self.drive(model, serial, obis, batch_size, started).await;
        self.metrics.sync_finished(obis, started.elapsed());

        match &result {
            Ok(outcome) => tracing::info!(
                serial,
                %obis,
                rows_saved = outcome.rows_saved,
                batches = outcome.batches,
                stop = ?outcome.stop,
                "profile sync finished"
            ),
            Err(e) => tracing::warn!(serial, %obis, error = %e, progress = e.made_progress(), "profile sync failed"),
        }
        result
    }

    async fn drive(
        &self,
        model: &str,
        serial: &str,
        obis: &ObisCode,
        batch_size: usize,
        started: Instant,
    ) -> Result<SyncOutcome, SyncError> {
        let failed = |e: CursorError| {
            let source = SyncCause::from(e);
            self.metrics.sync_failed(obis, source.label());
            SyncError::Failed {
                serial: serial.to_string(),
                obis: *obis,
                source,
            }
        };

        // RESOLVE_CURSOR
        let Some(cursor) = self
            .resolver
            .resolve_last_timestamp(serial, obis)
            .await
            .map_err(failed)?
        else {
            return Ok(SyncOutcome {
                rows_saved: 0,
                batches: 0,
                cursor: None,
                stop: StopReason::NoHistory,
            });
        };
        let period = self
            .resolver
            .resolve_capture_period(serial, obis)
            .await
            .map_err(failed)?;
        let scalers = self.resolver.resolve_scalers(serial, obis).await.map_err(failed)?;

        let window = read_window(period, batch_size, self.settings.unknown_period_window);
        let mut run = Run {
            model,
            serial,
            obis,
            period,
            scalers,
            cursor,
            rows_read: 0,
            rows_saved: 0,
            batches: 0,
        };
        let mut scan_from = cursor + READ_EPSILON;
        let mut step = Step::ReadBatch;

        loop {
            step = match step {
                Step::ReadBatch => {
                    let now = self.clock.now();
                    if scan_from > now {
                        Step::Done(StopReason::UpToDate)
                    } else if started.elapsed() >= self.settings.max_run_time {
                        Step::Done(StopReason::TimeBudget)
                    } else {
                        let to = scan_from.checked_add(window).map_or(now, |t| t.min(now));
                        match self.device.read_range(serial, obis, scan_from, to).await {
                            Ok(rows) => {
                                let rows = fresh_rows(rows, run.cursor, to);
                                scan_from = to + READ_EPSILON;
                                if !rows.is_empty() {
                                    Step::PersistBatch { rows, to, now }
                                } else if to >= now {
                                    Step::Done(StopReason::UpToDate)
                                } else {
                                    // A gap in the device buffer; keep scanning.
                                    tracing::debug!(serial, %obis, %to, "empty read window");
                                    Step::ReadBatch
                                }
                            }
                            Err(error) => Step::RecoverPartial { error, to },
                        }
                    }
                }

                Step::PersistBatch { rows, to, now } => {
                    if let Err(e) = self.persist(&mut run, &rows).await {
                        self.metrics.sync_failed(obis, "store");
                        return Err(run.error(SyncCause::Store(e)));
                    }
                    run.rows_read += rows.len();
                    if run.rows_read >= self.settings.max_rows_per_run {
                        Step::Done(StopReason::RowBudget)
                    } else if to >= now {
                        Step::Done(StopReason::UpToDate)
                    } else {
                        Step::ReadBatch
                    }
                }

                Step::RecoverPartial { error, to } => {
                    return Err(self.recover(&mut run, error, to).await);
                }

                Step::Done(stop) => return Ok(run.outcome(stop)),
            };
        }
    }

    /// PERSIST_BATCH + ADVANCE_CURSOR: the store moves the durable cursor in
    /// the same transaction, the cache follows.
    async fn persist(&self, run: &mut Run<'_>, rows: &[ProfileRow]) -> Result<(), StoreError> {
        let saved = self
            .store
            .save_batch_and_advance_cursor(run.serial, run.model, run.obis, rows, run.period, &run.scalers)
            .await?;

        run.cursor = run.cursor.max(saved.new_cursor);
        run.rows_saved += saved.rows_saved;
        run.batches += 1;
        self.resolver.record_advance(run.serial, run.obis, run.cursor);
        self.metrics.batch_persisted(run.obis, rows.len(), saved.rows_saved);
        tracing::debug!(
            serial = run.serial,
            obis = %run.obis,
            rows = rows.len(),
            saved = saved.rows_saved,
            cursor = %run.cursor,
            "profile batch persisted"
        );
        Ok(())
    }

    async fn recover(&self, run: &mut Run<'_>, error: DeviceError, to: OffsetDateTime) -> SyncError {
        tracing::warn!(serial = run.serial, obis = %run.obis, error = %error, "profile read failed, salvaging");

        let salvaged = fresh_rows(
            self.recovery.recover_partial(run.serial, run.obis).await,
            run.cursor,
            to,
        );
        if !salvaged.is_empty() {
            match self.persist(run, &salvaged).await {
                Ok(()) => self.metrics.rows_recovered(run.obis, salvaged.len()),
                Err(e) => tracing::error!(
                    serial = run.serial,
                    obis = %run.obis,
                    error = %e,
                    rows = salvaged.len(),
                    "failed to persist salvaged rows"
                ),
            }
        }

        self.metrics.sync_failed(run.obis, error.cause());
        run.error(SyncCause::Device(error))
    }
}
