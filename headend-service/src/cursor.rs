//! "Where did we leave off" per (meter, profile).
//!
//! Lookups go in-process cache, then the durable store, then the device
//! itself (only for a pair that has never been synced). The cache is an
//! accelerator only: evicting it at any time is safe.

use std::{num::NonZeroU32, sync::Arc};

use dashmap::DashMap;
use profile_store::{CapturePeriod, ObisCode, ProfileStore, ScalerTable, StoreError};
use time::{Duration, OffsetDateTime};

use crate::device::{DeviceError, ProfileDevice};

/// Distance between the bootstrapped cursor and the oldest buffered entry.
pub const BOOTSTRAP_EPSILON: Duration = Duration::SECOND;

#[derive(thiserror::Error, Debug)]
pub enum CursorError {
    #[error("cursor store: {0}")]
    Store(#[from] StoreError),
    #[error("cursor bootstrap: {0}")]
    Device(#[from] DeviceError),
}

type Key = (String, ObisCode);

fn key(serial: &str, obis: &ObisCode) -> Key {
    (serial.to_string(), *obis)
}

pub struct CursorResolver {
    store: Arc<dyn ProfileStore>,
    device: Arc<dyn ProfileDevice>,
    last_timestamps: DashMap<Key, OffsetDateTime>,
    capture_periods: DashMap<Key, NonZeroU32>,
    scalers: DashMap<Key, ScalerTable>,
}

impl CursorResolver {
    pub fn new(store: Arc<dyn ProfileStore>, device: Arc<dyn ProfileDevice>) -> Self {
        Self {
            store,
            device,
            last_timestamps: DashMap::new(),
            capture_periods: DashMap::new(),
            scalers: DashMap::new(),
        }
    }

    /// Loads the durable cursor and warms the cache from it.
    async fn load_stored(&self, serial: &str, obis: &ObisCode) -> Result<bool, CursorError> {
        let Some(cursor) = self.store.load_cursor(serial, obis).await? else {
            return Ok(false);
        };
        let k = key(serial, obis);
        self.merge_last_timestamp(k.clone(), cursor.last_timestamp);
        if let CapturePeriod::Known(seconds) = cursor.capture_period {
            self.capture_periods.entry(k).or_insert(seconds);
        }
        Ok(true)
    }

    fn merge_last_timestamp(&self, k: Key, ts: OffsetDateTime) {
        self.last_timestamps
            .entry(k)
            .and_modify(|cur| {
                if ts > *cur {
                    *cur = ts;
                }
            })
            .or_insert(ts);
    }

    /// Timestamp of the newest persisted row, or `None` when neither the store
    /// nor the device buffer holds anything for this profile yet.
    pub async fn resolve_last_timestamp(
        &self,
        serial: &str,
        obis: &ObisCode,
    ) -> Result<Option<OffsetDateTime>, CursorError> {
        let k = key(serial, obis);
        if let Some(ts) = self.last_timestamps.get(&k) {
            return Ok(Some(*ts));
        }

        if self.load_stored(serial, obis).await? {
            return Ok(self.last_timestamps.get(&k).map(|ts| *ts));
        }

        // First contact with this profile: start just before the oldest entry
        // the device still holds.
        let Some(oldest) = self.device.read_buffer_start(serial, obis).await? else {
            tracing::debug!(serial, %obis, "device profile buffer is empty");
            return Ok(None);
        };
        let ts = oldest - BOOTSTRAP_EPSILON;
        tracing::info!(serial, %obis, %oldest, "bootstrapped profile cursor from device buffer");
        self.merge_last_timestamp(k.clone(), ts);
        Ok(self.last_timestamps.get(&k).map(|ts| *ts))
    }

    /// Capture period of the profile. Only known periods are cached, so an
    /// unknown answer is asked again next time.
    pub async fn resolve_capture_period(
        &self,
        serial: &str,
        obis: &ObisCode,
    ) -> Result<CapturePeriod, CursorError> {
        let k = key(serial, obis);
        if let Some(seconds) = self.capture_periods.get(&k) {
            return Ok(CapturePeriod::Known(*seconds));
        }

        if !self.last_timestamps.contains_key(&k) {
            self.load_stored(serial, obis).await?;
            if let Some(seconds) = self.capture_periods.get(&k) {
                return Ok(CapturePeriod::Known(*seconds));
            }
        }

        self.refresh_capture_period(serial, obis).await
    }

    /// Reads the capture period from the device, replacing any cached value.
    pub async fn refresh_capture_period(
        &self,
        serial: &str,
        obis: &ObisCode,
    ) -> Result<CapturePeriod, CursorError> {
        let period = self.device.read_capture_period(serial, obis).await?;
        let k = key(serial, obis);
        match period {
            CapturePeriod::Known(seconds) => {
                self.capture_periods.insert(k, seconds);
            }
            CapturePeriod::Unknown => {
                tracing::warn!(serial, %obis, "device reports no capture period");
                self.capture_periods.remove(&k);
            }
        }
        Ok(period)
    }

    pub async fn resolve_scalers(
        &self,
        serial: &str,
        obis: &ObisCode,
    ) -> Result<ScalerTable, CursorError> {
        let k = key(serial, obis);
        if let Some(scalers) = self.scalers.get(&k) {
            return Ok(scalers.clone());
        }
        let scalers = self.device.read_scalers(serial, obis).await?;
        self.scalers.insert(k, scalers.clone());
        Ok(scalers)
    }

    /// Write-through after a batch was durably persisted. Never moves the
    /// cached cursor backwards.
    pub fn record_advance(&self, serial: &str, obis: &ObisCode, last_timestamp: OffsetDateTime) {
        self.merge_last_timestamp(key(serial, obis), last_timestamp);
    }

    pub fn cached_last_timestamp(&self, serial: &str, obis: &ObisCode) -> Option<OffsetDateTime> {
        self.last_timestamps.get(&key(serial, obis)).map(|ts| *ts)
    }

    pub fn evict(&self, serial: &str, obis: &ObisCode) {
        let k = key(serial, obis);
        self.last_timestamps.remove(&k);
        self.capture_periods.remove(&k);
        self.scalers.remove(&k);
    }

    pub fn evict_meter(&self, serial: &str) {
        self.last_timestamps.retain(|(s, _), _| s != serial);
        self.capture_periods.retain(|(s, _), _| s != serial);
        self.scalers.retain(|(s, _), _| s != serial);
    }

    pub fn clear(&self) {
        self.last_timestamps.clear();
        self.capture_periods.clear();
        self.scalers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::ScriptedDevice;
    use profile_store::{MemoryProfileStore, ProfileCursor, ProfileRow};
    use std::sync::atomic::Ordering;
    use time::macros::datetime;

    const LOAD: ObisCode = ObisCode::new(1, 0, 99, 1, 0, 255);

    fn resolver(
        device: ScriptedDevice,
    ) -> (CursorResolver, Arc<MemoryProfileStore>, Arc<ScriptedDevice>) {
        let store = Arc::new(MemoryProfileStore::new());
        let device = Arc::new(device);
        (CursorResolver::new(store.clone(), device.clone()), store, device)
    }

    #[tokio::test]
    async fn stored_cursor_wins_and_is_cached() {
        let (r, store, device) = resolver(ScriptedDevice::new(
            CapturePeriod::from_seconds(900),
            vec![ProfileRow::new(datetime!(2024-01-01 00:00 UTC))],
        ));
        store.seed_cursor(ProfileCursor {
            meter_serial: "m1".into(),
            profile_obis: LOAD,
            last_timestamp: datetime!(2024-02-01 00:00 UTC),
            capture_period: CapturePeriod::from_seconds(1800),
            updated_at: datetime!(2024-02-01 00:01 UTC),
        });

        for _ in 0..2 {
            assert_eq!(
                r.resolve_last_timestamp("m1", &LOAD).await.unwrap(),
                Some(datetime!(2024-02-01 00:00 UTC))
            );
        }
        assert_eq!(
            r.resolve_capture_period("m1", &LOAD).await.unwrap(),
            CapturePeriod::from_seconds(1800)
        );
        assert_eq!(device.bootstrap_reads.load(Ordering::SeqCst), 0);
        assert_eq!(device.period_reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_contact_bootstraps_from_device_buffer() {
        let (r, _store, device) = resolver(ScriptedDevice::new(
            CapturePeriod::from_seconds(900),
            vec![
                ProfileRow::new(datetime!(2024-01-01 00:15 UTC)),
                ProfileRow::new(datetime!(2024-01-01 00:00 UTC)),
            ],
        ));
        assert_eq!(
            r.resolve_last_timestamp("m1", &LOAD).await.unwrap(),
            Some(datetime!(2023-12-31 23:59:59 UTC))
        );
        r.resolve_last_timestamp("m1", &LOAD).await.unwrap();
        assert_eq!(device.bootstrap_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_device_buffer_resolves_to_none_and_is_not_cached() {
        let (r, _store, device) = resolver(ScriptedDevice::new(CapturePeriod::Unknown, vec![]));
        assert_eq!(r.resolve_last_timestamp("m1", &LOAD).await.unwrap(), None);
        assert_eq!(r.resolve_last_timestamp("m1", &LOAD).await.unwrap(), None);
        assert_eq!(device.bootstrap_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_capture_period_is_never_cached() {
        let (r, _store, device) = resolver(ScriptedDevice::new(CapturePeriod::Unknown, vec![]));
        assert_eq!(
            r.resolve_capture_period("m1", &LOAD).await.unwrap(),
            CapturePeriod::Unknown
        );
        device.set_capture_period(CapturePeriod::from_seconds(3600));
        assert_eq!(
            r.resolve_capture_period("m1", &LOAD).await.unwrap(),
            CapturePeriod::from_seconds(3600)
        );
        r.resolve_capture_period("m1", &LOAD).await.unwrap();
        assert_eq!(device.period_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_replaces_cached_period() {
        let (r, _store, device) = resolver(ScriptedDevice::new(CapturePeriod::from_seconds(900), vec![]));
        r.resolve_capture_period("m1", &LOAD).await.unwrap();
        device.set_capture_period(CapturePeriod::from_seconds(1800));
        assert_eq!(
            r.refresh_capture_period("m1", &LOAD).await.unwrap(),
            CapturePeriod::from_seconds(1800)
        );
        assert_eq!(
            r.resolve_capture_period("m1", &LOAD).await.unwrap(),
            CapturePeriod::from_seconds(1800)
        );
    }

    #[tokio::test]
    async fn record_advance_is_monotonic() {
        let (r, _store, _device) = resolver(ScriptedDevice::new(CapturePeriod::Unknown, vec![]));
        r.record_advance("m1", &LOAD, datetime!(2024-01-01 02:00 UTC));
        r.record_advance("m1", &LOAD, datetime!(2024-01-01 01:00 UTC));
        assert_eq!(
            r.cached_last_timestamp("m1", &LOAD),
            Some(datetime!(2024-01-01 02:00 UTC))
        );
    }

    #[tokio::test]
    async fn eviction_falls_back_to_store() {
        let (r, store, device) = resolver(ScriptedDevice::new(CapturePeriod::Unknown, vec![]));
        r.record_advance("m1", &LOAD, datetime!(2024-01-01 02:00 UTC));
        r.resolve_scalers("m1", &LOAD).await.unwrap();
        r.evict_meter("m1");
        assert_eq!(r.cached_last_timestamp("m1", &LOAD), None);

        store.seed_cursor(ProfileCursor {
            meter_serial: "m1".into(),
            profile_obis: LOAD,
            last_timestamp: datetime!(2024-01-01 01:00 UTC),
            capture_period: CapturePeriod::Unknown,
            updated_at: datetime!(2024-01-01 01:00 UTC),
        });
        assert_eq!(
            r.resolve_last_timestamp("m1", &LOAD).await.unwrap(),
            Some(datetime!(2024-01-01 01:00 UTC))
        );
        r.resolve_scalers("m1", &LOAD).await.unwrap();
        assert_eq!(device.scaler_reads.load(Ordering::SeqCst), 2);

        r.clear();
        assert_eq!(r.cached_last_timestamp("m1", &LOAD), None);
    }
}
