use std::{collections::BTreeMap, fmt, num::NonZeroU32, time::Duration};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::ObisCode;

/// Column key -> decimal scaler exponent (value * 10^scaler).
pub type ScalerTable = BTreeMap<String, i8>;

/// Untyped value as delivered by the device codec for one profile column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RawValue {
    Null,
    Bool(bool),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    OctetString(Vec<u8>),
    Text(String),
    #[serde(with = "time::serde::rfc3339")]
    DateTime(OffsetDateTime),
    Structure(Vec<RawValue>),
}

/// One entry of a device load profile buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRow {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub values: BTreeMap<String, RawValue>,
}

impl ProfileRow {
    pub fn new(timestamp: OffsetDateTime) -> Self {
        Self {
            timestamp,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, column: impl Into<String>, value: RawValue) -> Self {
        self.values.insert(column.into(), value);
        self
    }
}

/// Device sampling interval for a profile.
///
/// `Unknown` is kept distinct from any numeric value: a device reporting zero
/// or not answering never turns into a 0s or 1s period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapturePeriod {
    Known(NonZeroU32),
    Unknown,
}

impl CapturePeriod {
    pub fn from_seconds(seconds: u32) -> Self {
        NonZeroU32::new(seconds).map_or(Self::Unknown, Self::Known)
    }

    pub fn seconds(&self) -> Option<u32> {
        match self {
            Self::Known(s) => Some(s.get()),
            Self::Unknown => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        self.seconds().map(|s| Duration::from_secs(u64::from(s)))
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

impl fmt::Display for CapturePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(s) => write!(f, "{s}s"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Durable "synchronized up to" bookmark for one (meter, profile) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileCursor {
    pub meter_serial: String,
    pub profile_obis: ObisCode,
    pub last_timestamp: OffsetDateTime,
    pub capture_period: CapturePeriod,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileSyncResult {
    /// Rows that did not exist before this call; re-written rows are not counted.
    pub rows_saved: usize,
    pub new_cursor: OffsetDateTime,
}
