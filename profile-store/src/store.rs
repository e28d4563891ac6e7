use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use time::OffsetDateTime;

use crate::domain::{CapturePeriod, ObisCode, ProfileCursor, ProfileRow, ProfileSyncResult, ScalerTable};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("row encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("refusing to persist an empty batch for {serial} {obis}")]
    EmptyBatch { serial: String, obis: ObisCode },
    #[error("stored cursor for {serial} is corrupt: {detail}")]
    CorruptCursor { serial: String, detail: String },
}

/// Durable profile persistence.
///
/// `save_batch_and_advance_cursor` must write the rows and move the cursor in
/// one atomic unit. Rows are upserted on (meter, profile, timestamp), so
/// re-reading an already covered range never produces duplicates, and the
/// cursor only ever moves forward.
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load_cursor(
        &self,
        serial: &str,
        obis: &ObisCode,
    ) -> Result<Option<ProfileCursor>, StoreError>;

    async fn save_batch_and_advance_cursor(
        &self,
        serial: &str,
        model: &str,
        obis: &ObisCode,
        rows: &[ProfileRow],
        capture_period: CapturePeriod,
        scalers: &ScalerTable,
    ) -> Result<ProfileSyncResult, StoreError>;
}

type ProfileKey = (String, ObisCode);

#[derive(Debug, Clone)]
struct StoredRow {
    model: String,
    row: ProfileRow,
    scalers: ScalerTable,
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<ProfileKey, BTreeMap<OffsetDateTime, StoredRow>>,
    cursors: HashMap<ProfileKey, ProfileCursor>,
}

/// Process-local store used by tests and by deployments without a database.
#[derive(Default)]
pub struct MemoryProfileStore {
    state: Mutex<MemoryState>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a cursor as if a previous process had persisted it.
    pub fn seed_cursor(&self, cursor: ProfileCursor) {
        let key = (cursor.meter_serial.clone(), cursor.profile_obis);
        self.state().cursors.insert(key, cursor);
    }

    pub fn cursor(&self, serial: &str, obis: &ObisCode) -> Option<ProfileCursor> {
        self.state()
            .cursors
            .get(&(serial.to_string(), *obis))
            .cloned()
    }

    /// Stored rows in timestamp order.
    pub fn rows(&self, serial: &str, obis: &ObisCode) -> Vec<ProfileRow> {
        self.state()
            .rows
            .get(&(serial.to_string(), *obis))
            .map(|rows| rows.values().map(|s| s.row.clone()).collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self) -> usize {
        self.state().rows.values().map(BTreeMap::len).sum()
    }

    pub fn model_of(&self, serial: &str, obis: &ObisCode, ts: OffsetDateTime) -> Option<String> {
        self.state()
            .rows
            .get(&(serial.to_string(), *obis))
            .and_then(|rows| rows.get(&ts))
            .map(|s| s.model.clone())
    }

    pub fn scalers_of(&self, serial: &str, obis: &ObisCode, ts: OffsetDateTime) -> Option<ScalerTable> {
        self.state()
            .rows
            .get(&(serial.to_string(), *obis))
            .and_then(|rows| rows.get(&ts))
            .map(|s| s.scalers.clone())
    }
}

#[async_trait::async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn load_cursor(
        &self,
        serial: &str,
        obis: &ObisCode,
    ) -> Result<Option<ProfileCursor>, StoreError> {
        Ok(self.cursor(serial, obis))
    }

    async fn save_batch_and_advance_cursor(
        &self,
        serial: &str,
        model: &str,
        obis: &ObisCode,
        rows: &[ProfileRow],
        capture_period: CapturePeriod,
        scalers: &ScalerTable,
    ) -> Result<ProfileSyncResult, StoreError> {
        let Some(batch_max) = rows.iter().map(|r| r.timestamp).max() else {
            return Err(StoreError::EmptyBatch {
                serial: serial.to_string(),
                obis: *obis,
            });
        };

        let key = (serial.to_string(), *obis);
        let now = OffsetDateTime::now_utc();

        // Single guard for rows and cursor: both become visible together.
        let mut state = self.state();

        let table = state.rows.entry(key.clone()).or_default();
        let mut inserted = 0;
        for row in rows {
            let stored = StoredRow {
                model: model.to_string(),
                row: row.clone(),
                scalers: scalers.clone(),
            };
            if table.insert(row.timestamp, stored).is_none() {
                inserted += 1;
            }
        }

        let cursor = state
            .cursors
            .entry(key)
            .and_modify(|c| {
                if batch_max > c.last_timestamp {
                    c.last_timestamp = batch_max;
                }
                if capture_period.is_known() {
                    c.capture_period = capture_period;
                }
                c.updated_at = now;
            })
            .or_insert_with(|| ProfileCursor {
                meter_serial: serial.to_string(),
                profile_obis: *obis,
                last_timestamp: batch_max,
                capture_period,
                updated_at: now,
            });

        Ok(ProfileSyncResult {
            rows_saved: inserted,
            new_cursor: cursor.last_timestamp,
        })
    }
}
