use std::time::Duration;

use sqlx::{postgres::PgPool, types::Json, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::{
    domain::{CapturePeriod, ObisCode, ProfileCursor, ProfileRow, ProfileSyncResult, ScalerTable},
    store::{ProfileStore, StoreError},
};

/// Tables used by [`PgProfileStore`]. Applied by [`PgProfileStore::ensure_schema`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profile_rows (
    meter_serial  TEXT        NOT NULL,
    profile_obis  TEXT        NOT NULL,
    ts            TIMESTAMPTZ NOT NULL,
    model         TEXT        NOT NULL,
    readings      JSONB       NOT NULL,
    scalers       JSONB       NOT NULL,
    PRIMARY KEY (meter_serial, profile_obis, ts)
);

CREATE TABLE IF NOT EXISTS profile_cursors (
    meter_serial        TEXT        NOT NULL,
    profile_obis        TEXT        NOT NULL,
    last_ts             TIMESTAMPTZ NOT NULL,
    capture_period_secs INTEGER,
    updated_at          TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (meter_serial, profile_obis)
);
"#;

// Six binds per row; keeps every statement well under the 65535 parameter limit.
const ROWS_PER_STATEMENT: usize = 1000;

#[derive(Debug, Clone, sqlx::FromRow)]
struct CursorRecord {
    last_ts: OffsetDateTime,
    capture_period_secs: Option<i32>,
    updated_at: OffsetDateTime,
}

pub struct PgProfileStore {
    pool: PgPool,
    max_retries: u32,
    retry_backoff: Duration,
}

impl PgProfileStore {
    pub fn new(pool: PgPool, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            max_retries,
            retry_backoff,
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn write_batch(
        &self,
        serial: &str,
        model: &str,
        obis: &ObisCode,
        rows: &[(OffsetDateTime, serde_json::Value)],
        batch_max: OffsetDateTime,
        capture_period: CapturePeriod,
        scalers: &serde_json::Value,
    ) -> Result<ProfileSyncResult, sqlx::Error> {
        let obis = obis.to_string();
        let mut tx = self.pool.begin().await?;

        let mut inserted = 0;
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO profile_rows (meter_serial, profile_obis, ts, model, readings, scalers) ",
            );
            builder.push_values(chunk, |mut b, (ts, readings)| {
                b.push_bind(serial.to_string())
                    .push_bind(obis.clone())
                    .push_bind(*ts)
                    .push_bind(model.to_string())
                    .push_bind(Json(readings.clone()))
                    .push_bind(Json(scalers.clone()));
            });
            builder.push(
                " ON CONFLICT (meter_serial, profile_obis, ts) DO UPDATE SET \
                 model = EXCLUDED.model, readings = EXCLUDED.readings, scalers = EXCLUDED.scalers \
                 RETURNING (xmax = 0) AS inserted",
            );

            let flags: Vec<bool> = builder.build_query_scalar().fetch_all(&mut *tx).await?;
            inserted += flags.into_iter().filter(|fresh| *fresh).count();
        }

        let period = capture_period.seconds().and_then(|s| i32::try_from(s).ok());
        let new_cursor: OffsetDateTime = sqlx::query_scalar(
            r#"
            INSERT INTO profile_cursors (meter_serial, profile_obis, last_ts, capture_period_secs, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (meter_serial, profile_obis) DO UPDATE SET
                last_ts = GREATEST(profile_cursors.last_ts, EXCLUDED.last_ts),
                capture_period_secs = COALESCE(EXCLUDED.capture_period_secs, profile_cursors.capture_period_secs),
                updated_at = EXCLUDED.updated_at
            RETURNING last_ts
            "#,
        )
        .bind(serial)
        .bind(&obis)
        .bind(batch_max)
        .bind(period)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ProfileSyncResult {
            rows_saved: inserted,
            new_cursor,
        })
    }
}

fn encode_values(row: &ProfileRow) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(&row.values)
}

#[async_trait::async_trait]
impl ProfileStore for PgProfileStore {
    async fn load_cursor(
        &self,
        serial: &str,
        obis: &ObisCode,
    ) -> Result<Option<ProfileCursor>, StoreError> {
        let record = sqlx::query_as::<_, CursorRecord>(
            r#"
            SELECT last_ts, capture_period_secs, updated_at
            FROM profile_cursors
            WHERE meter_serial = $1
              AND profile_obis = $2
            "#,
        )
        .bind(serial)
        .bind(obis.to_string())
        .fetch_optional(&self.pool)
        .await?;

        record
            .map(|r| -> Result<ProfileCursor, StoreError> {
                let seconds = match r.capture_period_secs {
                    None => 0,
                    Some(s) => u32::try_from(s).map_err(|_| StoreError::CorruptCursor {
                        serial: serial.to_string(),
                        detail: format!("negative capture period {s}"),
                    })?,
                };
                Ok(ProfileCursor {
                    meter_serial: serial.to_string(),
                    profile_obis: *obis,
                    last_timestamp: r.last_ts,
                    capture_period: CapturePeriod::from_seconds(seconds),
                    updated_at: r.updated_at,
                })
            })
            .transpose()
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

        let encoded = rows
            .iter()
            .map(|r| Ok((r.timestamp, encode_values(r)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        let scalers = serde_json::to_value(scalers)?;

        let mut attempt: u32 = 0;
        loop {
            match self
                .write_batch(serial, model, obis, &encoded, batch_max, capture_period, &scalers)
                .await
            {
                Ok(result) => {
                    metrics::counter!("profile_store_rows_inserted_total").increment(result.rows_saved as u64);
                    return Ok(result);
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        serial,
                        "profile batch write failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, serial, "profile batch write failed, giving up");
                    metrics::counter!("profile_store_errors_total").increment(1);
                    return Err(StoreError::Database(e));
                }
            }
        }
    }
}
