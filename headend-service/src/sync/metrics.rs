use std::time::Duration;

use profile_store::ObisCode;

/// Fire-and-forget observations from the sync engine. Implementations must
/// not block.
pub trait SyncMetrics: Send + Sync {
    fn batch_persisted(&self, obis: &ObisCode, rows_read: usize, rows_saved: usize);
    fn rows_recovered(&self, obis: &ObisCode, rows: usize);
    fn sync_failed(&self, obis: &ObisCode, cause: &'static str);
    fn sync_finished(&self, obis: &ObisCode, elapsed: Duration);
}

/// Publishes through the process-wide `metrics` recorder.
pub struct PrometheusSyncMetrics;

impl SyncMetrics for PrometheusSyncMetrics {
    fn batch_persisted(&self, obis: &ObisCode, rows_read: usize, rows_saved: usize) {
        let obis = obis.to_string();
        metrics::counter!("profile_sync_batches_total", "obis" => obis.clone()).increment(1);
        metrics::counter!("profile_sync_rows_read_total", "obis" => obis.clone())
            .increment(rows_read as u64);
        metrics::counter!("profile_sync_rows_saved_total", "obis" => obis).increment(rows_saved as u64);
    }

    fn rows_recovered(&self, obis: &ObisCode, rows: usize) {
        metrics::counter!("profile_sync_recoveries_total", "obis" => obis.to_string()).increment(1);
        metrics::counter!("profile_sync_rows_recovered_total", "obis" => obis.to_string())
            .increment(rows as u64);
    }

    fn sync_failed(&self, obis: &ObisCode, cause: &'static str) {
        metrics::counter!(
            "profile_sync_failures_total",
            "obis" => obis.to_string(),
            "cause" => cause
        )
        .increment(1);
    }

    fn sync_finished(&self, obis: &ObisCode, elapsed: Duration) {
        metrics::histogram!("profile_sync_duration_seconds", "obis" => obis.to_string())
            .record(elapsed.as_secs_f64());
    }
}
