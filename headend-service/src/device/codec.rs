//! Seam to the external DLMS/COSEM codec plus typed decoding of the values it
//! hands back.

use bytes::Bytes;
use profile_store::{CapturePeriod, ObisCode, ProfileRow, RawValue, ScalerTable};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("device session no longer valid: {0}")]
    SessionInvalid(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("expected {expected}, found {found}")]
    UnexpectedType { expected: &'static str, found: String },
    #[error("unsupported interface class {0}")]
    UnsupportedClass(u16),
}

/// Which entries of a profile buffer to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(serde::Serialize, serde::Deserialize))]
pub enum RangeSelector {
    /// Entries captured in `[from, to]`.
    Time { from: OffsetDateTime, to: OffsetDateTime },
    /// Entries by 1-based position in the buffer, oldest first.
    Entries { from: u32, to: u32 },
}

/// One decoded block of a (possibly multi-block) profile read.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileBlock {
    pub block_number: u32,
    pub last_block: bool,
    /// Only rows whose bytes were received in full.
    pub rows: Vec<ProfileRow>,
}

/// Invoke id carried by a GET request and echoed in its response. Four bits
/// wide, as in the invoke-id-and-priority byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvokeId(u8);

impl InvokeId {
    pub const MASK: u8 = 0x0F;

    pub fn new(value: u8) -> Self {
        Self(value & Self::MASK)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// Byte transcoding for the application protocol. Implemented outside this
/// crate; requests go out through the correlation tracker unchanged.
pub trait DeviceCodec: Send + Sync {
    fn association_request(&self, serial: &str) -> Bytes;
    fn check_association_response(&self, frame: &[u8]) -> Result<(), CodecError>;

    /// Invoke id of a response frame; `None` for frames that carry none, such
    /// as association responses.
    fn response_invoke_id(&self, frame: &[u8]) -> Option<InvokeId>;

    fn profile_read_request(&self, invoke: InvokeId, obis: &ObisCode, selector: RangeSelector) -> Bytes;
    fn next_block_request(&self, invoke: InvokeId, block_number: u32) -> Bytes;
    fn decode_profile_block(&self, frame: &[u8]) -> Result<ProfileBlock, CodecError>;

    fn attribute_request(&self, invoke: InvokeId, class_id: u16, obis: &ObisCode, attribute: u8) -> Bytes;
    fn decode_attribute(&self, frame: &[u8]) -> Result<RawValue, CodecError>;

    /// Scaler per capture column of the profile at `obis`.
    fn scaler_request(&self, invoke: InvokeId, obis: &ObisCode) -> Bytes;
    fn decode_scalers(&self, frame: &[u8]) -> Result<ScalerTable, CodecError>;
}

/// COSEM interface classes this head-end decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Data,
    Register,
    DemandRegister,
    ProfileGeneric,
    Clock,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Number(f64),
    Timestamp(OffsetDateTime),
    Period(CapturePeriod),
    Count(u64),
    Raw(RawValue),
}

impl ObjectKind {
    pub fn from_class_id(class_id: u16) -> Result<Self, CodecError> {
        match class_id {
            1 => Ok(Self::Data),
            3 => Ok(Self::Register),
            5 => Ok(Self::DemandRegister),
            7 => Ok(Self::ProfileGeneric),
            8 => Ok(Self::Clock),
            other => Err(CodecError::UnsupportedClass(other)),
        }
    }

    pub fn class_id(self) -> u16 {
        match self {
            Self::Data => 1,
            Self::Register => 3,
            Self::DemandRegister => 5,
            Self::ProfileGeneric => 7,
            Self::Clock => 8,
        }
    }

    /// Decodes attribute `attribute` of an object of this class. `scaler`
    /// applies to register values only.
    pub fn decode(self, attribute: u8, raw: RawValue, scaler: i8) -> Result<TypedValue, CodecError> {
        match self {
            Self::Data => Ok(match numeric(&raw) {
                Some(v) => TypedValue::Number(v),
                None => TypedValue::Raw(raw),
            }),
            Self::Register => match attribute {
                2 => scaled(&raw, scaler),
                _ => Ok(TypedValue::Raw(raw)),
            },
            Self::DemandRegister => match attribute {
                // current_average_value, last_average_value
                2 | 3 => scaled(&raw, scaler),
                // capture_time, start_time_current
                6 | 7 => cosem_date_time(&raw).map(TypedValue::Timestamp),
                // period (seconds)
                8 => unsigned(&raw).map(TypedValue::Count),
                _ => Ok(TypedValue::Raw(raw)),
            },
            Self::ProfileGeneric => match attribute {
                4 => {
                    let seconds = unsigned(&raw)?;
                    Ok(TypedValue::Period(CapturePeriod::from_seconds(
                        u32::try_from(seconds).unwrap_or(0),
                    )))
                }
                // entries_in_use, profile_entries
                7 | 8 => unsigned(&raw).map(TypedValue::Count),
                _ => Ok(TypedValue::Raw(raw)),
            },
            Self::Clock => match attribute {
                2 => cosem_date_time(&raw).map(TypedValue::Timestamp),
                _ => Ok(TypedValue::Raw(raw)),
            },
        }
    }
}

fn describe(raw: &RawValue) -> String {
    format!("{raw:?}")
}

fn numeric(raw: &RawValue) -> Option<f64> {
    match raw {
        RawValue::Integer(v) => Some(*v as f64),
        RawValue::Unsigned(v) => Some(*v as f64),
        RawValue::Float(v) => Some(*v),
        _ => None,
    }
}

fn unsigned(raw: &RawValue) -> Result<u64, CodecError> {
    match raw {
        RawValue::Unsigned(v) => Ok(*v),
        RawValue::Integer(v) if *v >= 0 => Ok(*v as u64),
        other => Err(CodecError::UnexpectedType {
            expected: "unsigned integer",
            found: describe(other),
        }),
    }
}

fn scaled(raw: &RawValue, scaler: i8) -> Result<TypedValue, CodecError> {
    let v = numeric(raw).ok_or_else(|| CodecError::UnexpectedType {
        expected: "number",
        found: describe(raw),
    })?;
    // Divide for negative scalers: 10^-n is inexact, 10^n is not.
    let factor = 10f64.powi(i32::from(scaler.unsigned_abs()));
    Ok(TypedValue::Number(if scaler < 0 { v / factor } else { v * factor }))
}

const DEVIATION_NOT_SPECIFIED: i16 = i16::MIN;

/// Decodes a 12-byte COSEM date-time octet string (or passes a codec-decoded
/// timestamp through).
///
/// Deviation is minutes of UTC relative to local time, so local = UTC - deviation.
pub fn cosem_date_time(raw: &RawValue) -> Result<OffsetDateTime, CodecError> {
    let bytes = match raw {
        RawValue::DateTime(ts) => return Ok(*ts),
        RawValue::OctetString(b) if b.len() == 12 => b,
        other => {
            return Err(CodecError::UnexpectedType {
                expected: "12-byte date-time",
                found: describe(other),
            })
        }
    };

    let bad = |what: &str| CodecError::Malformed(format!("date-time {what} out of range: {bytes:02X?}"));

    let year = i32::from(u16::from_be_bytes([bytes[0], bytes[1]]));
    let month = Month::try_from(bytes[2]).map_err(|_| bad("month"))?;
    let date = Date::from_calendar_date(year, month, bytes[3]).map_err(|_| bad("date"))?;

    let hundredths = if bytes[8] == 0xFF { 0 } else { bytes[8] };
    let time = Time::from_hms_milli(bytes[5], bytes[6], bytes[7], u16::from(hundredths) * 10)
        .map_err(|_| bad("time"))?;

    let deviation = i16::from_be_bytes([bytes[9], bytes[10]]);
    let offset = if deviation == DEVIATION_NOT_SPECIFIED {
        UtcOffset::UTC
    } else {
        UtcOffset::from_whole_seconds(-i32::from(deviation) * 60).map_err(|_| bad("deviation"))?
    };

    Ok(PrimitiveDateTime::new(date, time).assume_offset(offset))
}
