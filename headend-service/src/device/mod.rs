pub mod codec;
pub mod multiplexed;
pub mod salvage;

use std::time::Duration;

use profile_store::{CapturePeriod, ObisCode, ProfileRow, ScalerTable};
use time::OffsetDateTime;

use crate::correlation::CorrelationError;

pub use codec::{CodecError, DeviceCodec, InvokeId, ObjectKind, ProfileBlock, RangeSelector, TypedValue};
pub use multiplexed::MultiplexedDevice;
pub use salvage::BlockSalvage;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("meter {0} is not connected")]
    NotConnected(String),
    #[error("meter {serial} did not answer within {after:?}")]
    Timeout { serial: String, after: Duration },
    #[error("association with meter {serial} lost: {reason}")]
    AssociationLost { serial: String, reason: String },
    #[error("malformed block from meter {serial}: {detail}")]
    MalformedBlock { serial: String, detail: String },
    #[error("meter {serial} denied access: {detail}")]
    AccessDenied { serial: String, detail: String },
    #[error("meter {0} already has a request in flight")]
    Busy(String),
}

impl DeviceError {
    /// Short label for metrics.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::NotConnected(_) => "not_connected",
            Self::Timeout { .. } => "timeout",
            Self::AssociationLost { .. } => "association_lost",
            Self::MalformedBlock { .. } => "malformed_block",
            Self::AccessDenied { .. } => "access_denied",
            Self::Busy(_) => "busy",
        }
    }

    /// Whether the device session must be re-established before the next request.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::AssociationLost { .. })
    }
}

impl From<CorrelationError> for DeviceError {
    fn from(e: CorrelationError) -> Self {
        match e {
            CorrelationError::NotConnected(serial) => Self::NotConnected(serial),
            CorrelationError::RequestInFlight { serial, .. } => Self::Busy(serial),
            CorrelationError::Timeout { serial, after, .. } => Self::Timeout { serial, after },
            CorrelationError::ChannelClosed { serial, .. } => Self::AssociationLost {
                serial,
                reason: "transport closed".to_string(),
            },
        }
    }
}

/// Profile-level device operations used by the cursor resolver and the sync engine.
#[async_trait::async_trait]
pub trait ProfileDevice: Send + Sync {
    /// Every buffer entry captured in `[from, to]`.
    async fn read_range(
        &self,
        serial: &str,
        obis: &ObisCode,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<ProfileRow>, DeviceError>;

    async fn read_capture_period(
        &self,
        serial: &str,
        obis: &ObisCode,
    ) -> Result<CapturePeriod, DeviceError>;

    /// Capture time of the oldest entry still in the device buffer, if any.
    async fn read_buffer_start(
        &self,
        serial: &str,
        obis: &ObisCode,
    ) -> Result<Option<OffsetDateTime>, DeviceError>;

    async fn read_scalers(&self, serial: &str, obis: &ObisCode) -> Result<ScalerTable, DeviceError>;
}

/// Best-effort salvage of rows fully received before a read failed.
#[async_trait::async_trait]
pub trait PartialRecovery: Send + Sync {
    async fn recover_partial(&self, serial: &str, obis: &ObisCode) -> Vec<ProfileRow>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! JSON stand-in for the external codec and a scripted meter that answers
    //! through the correlation tracker.

    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use bytes::Bytes;
    use profile_store::{CapturePeriod, ObisCode, ProfileRow, RawValue, ScalerTable};
    use serde::{Deserialize, Serialize};
    use time::OffsetDateTime;
    use tokio::sync::mpsc;

    use super::{
        codec::{CodecError, DeviceCodec, InvokeId, ProfileBlock, RangeSelector},
        BlockSalvage, DeviceError, PartialRecovery, ProfileDevice,
    };
    use crate::{correlation::CorrelationTracker, registry::ChannelId};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub enum FakeRequest {
        Associate(String),
        ReadProfile { obis: String, selector: RangeSelector },
        NextBlock(u32),
        Attribute { class_id: u16, obis: String, attribute: u8 },
        Scalers(String),
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub enum FakeResponse {
        Associated,
        Rejected,
        SessionInvalid,
        Block { number: u32, last: bool, rows: Vec<ProfileRow> },
        Value(RawValue),
        Scalers(ScalerTable),
        Garbage,
    }

    /// Wire envelope: the body plus the invoke id it carries, if any.
    #[derive(Debug, Serialize, Deserialize)]
    struct Envelope<T> {
        invoke: Option<u8>,
        body: T,
    }

    pub struct JsonCodec;

    fn encode<T: Serialize>(invoke: Option<InvokeId>, body: &T) -> Bytes {
        let envelope = Envelope {
            invoke: invoke.map(InvokeId::get),
            body,
        };
        Bytes::from(serde_json::to_vec(&envelope).unwrap())
    }

    /// Frame a meter sends in reply to a request carrying `invoke`.
    pub fn reply(invoke: Option<u8>, response: &FakeResponse) -> Bytes {
        encode(invoke.map(InvokeId::new), response)
    }

    fn decode(frame: &[u8]) -> Result<FakeResponse, CodecError> {
        match serde_json::from_slice::<Envelope<FakeResponse>>(frame).map(|e| e.body) {
            Ok(FakeResponse::Garbage) | Err(_) => Err(CodecError::Malformed("garbage".into())),
            Ok(FakeResponse::SessionInvalid) => Err(CodecError::SessionInvalid("released".into())),
            Ok(other) => Ok(other),
        }
    }

    impl DeviceCodec for JsonCodec {
        fn association_request(&self, serial: &str) -> Bytes {
            encode(None, &FakeRequest::Associate(serial.to_string()))
        }

        fn response_invoke_id(&self, frame: &[u8]) -> Option<InvokeId> {
            serde_json::from_slice::<Envelope<serde::de::IgnoredAny>>(frame)
                .ok()
                .and_then(|e| e.invoke)
                .map(InvokeId::new)
        }

        fn check_association_response(&self, frame: &[u8]) -> Result<(), CodecError> {
            match decode(frame)? {
                FakeResponse::Associated => Ok(()),
                FakeResponse::Rejected => Err(CodecError::AccessDenied("rejected".into())),
                other => Err(CodecError::Malformed(format!("{other:?}"))),
            }
        }

        fn profile_read_request(&self, invoke: InvokeId, obis: &ObisCode, selector: RangeSelector) -> Bytes {
            encode(
                Some(invoke),
                &FakeRequest::ReadProfile {
                    obis: obis.to_string(),
                    selector,
                },
            )
        }

        fn next_block_request(&self, invoke: InvokeId, block_number: u32) -> Bytes {
            encode(Some(invoke), &FakeRequest::NextBlock(block_number))
        }

        fn decode_profile_block(&self, frame: &[u8]) -> Result<ProfileBlock, CodecError> {
            match decode(frame)? {
                FakeResponse::Block { number, last, rows } => Ok(ProfileBlock {
                    block_number: number,
                    last_block: last,
                    rows,
                }),
                other => Err(CodecError::Malformed(format!("{other:?}"))),
            }
        }

        fn attribute_request(&self, invoke: InvokeId, class_id: u16, obis: &ObisCode, attribute: u8) -> Bytes {
            encode(
                Some(invoke),
                &FakeRequest::Attribute {
                    class_id,
                    obis: obis.to_string(),
                    attribute,
                },
            )
        }

        fn decode_attribute(&self, frame: &[u8]) -> Result<RawValue, CodecError> {
            match decode(frame)? {
                FakeResponse::Value(v) => Ok(v),
                other => Err(CodecError::Malformed(format!("{other:?}"))),
            }
        }

        fn scaler_request(&self, invoke: InvokeId, obis: &ObisCode) -> Bytes {
            encode(Some(invoke), &FakeRequest::Scalers(obis.to_string()))
        }

        fn decode_scalers(&self, frame: &[u8]) -> Result<ScalerTable, CodecError> {
            match decode(frame)? {
                FakeResponse::Scalers(s) => Ok(s),
                other => Err(CodecError::Malformed(format!("{other:?}"))),
            }
        }
    }

    /// Drains a channel's outbound queue and answers each request with the
    /// script's reply under the request's invoke id; `None` leaves the request
    /// unanswered.
    pub fn spawn_meter<F>(
        mut outbound: mpsc::Receiver<Bytes>,
        tracker: Arc<CorrelationTracker>,
        channel: ChannelId,
        mut script: F,
    ) -> Arc<Mutex<Vec<FakeRequest>>>
    where
        F: FnMut(&FakeRequest) -> Option<FakeResponse> + Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let Ok(Envelope { invoke, body: request }) =
                    serde_json::from_slice::<Envelope<FakeRequest>>(&frame)
                else {
                    continue;
                };
                log.lock().unwrap().push(request.clone());
                if let Some(response) = script(&request) {
                    tracker.on_frame_received(channel, reply(invoke, &response));
                }
            }
        });
        seen
    }

    /// In-memory meter buffer implementing the profile-level device traits.
    pub struct ScriptedDevice {
        buffer: Mutex<Vec<ProfileRow>>,
        capture_period: Mutex<CapturePeriod>,
        scalers: ScalerTable,
        fail_next_read: Mutex<Option<(usize, DeviceError)>>,
        salvage: BlockSalvage,
        pub range_reads: Mutex<Vec<(OffsetDateTime, OffsetDateTime)>>,
        pub period_reads: AtomicUsize,
        pub bootstrap_reads: AtomicUsize,
        pub scaler_reads: AtomicUsize,
    }

    impl ScriptedDevice {
        pub fn new(capture_period: CapturePeriod, rows: Vec<ProfileRow>) -> Self {
            Self {
                buffer: Mutex::new(rows),
                capture_period: Mutex::new(capture_period),
                scalers: [("1.0.1.8.0.255".to_string(), -3)].into_iter().collect(),
                fail_next_read: Mutex::new(None),
                salvage: BlockSalvage::new(),
                range_reads: Mutex::new(Vec::new()),
                period_reads: AtomicUsize::new(0),
                bootstrap_reads: AtomicUsize::new(0),
                scaler_reads: AtomicUsize::new(0),
            }
        }

        pub fn push_rows(&self, rows: impl IntoIterator<Item = ProfileRow>) {
            self.buffer.lock().unwrap().extend(rows);
        }

        pub fn set_capture_period(&self, period: CapturePeriod) {
            *self.capture_period.lock().unwrap() = period;
        }

        /// The next range read delivers `rows_before_failure` complete rows
        /// to the salvage buffer and then fails with `error`.
        pub fn fail_next_read(&self, rows_before_failure: usize, error: DeviceError) {
            *self.fail_next_read.lock().unwrap() = Some((rows_before_failure, error));
        }

        pub fn scalers(&self) -> &ScalerTable {
            &self.scalers
        }
    }

    #[async_trait::async_trait]
    impl ProfileDevice for ScriptedDevice {
        async fn read_range(
            &self,
            serial: &str,
            obis: &ObisCode,
            from: OffsetDateTime,
            to: OffsetDateTime,
        ) -> Result<Vec<ProfileRow>, DeviceError> {
            self.range_reads.lock().unwrap().push((from, to));
            let mut rows: Vec<ProfileRow> = self
                .buffer
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.timestamp >= from && r.timestamp <= to)
                .cloned()
                .collect();
            rows.sort_by_key(|r| r.timestamp);

            let failure = self.fail_next_read.lock().unwrap().take();
            if let Some((complete, error)) = failure {
                self.salvage.begin(serial, obis);
                let complete = complete.min(rows.len());
                self.salvage.stash(serial, obis, &rows[..complete]);
                return Err(error);
            }
            Ok(rows)
        }

        async fn read_capture_period(
            &self,
            _serial: &str,
            _obis: &ObisCode,
        ) -> Result<CapturePeriod, DeviceError> {
            self.period_reads.fetch_add(1, Ordering::SeqCst);
            Ok(*self.capture_period.lock().unwrap())
        }

        async fn read_buffer_start(
            &self,
            _serial: &str,
            _obis: &ObisCode,
        ) -> Result<Option<OffsetDateTime>, DeviceError> {
            self.bootstrap_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.buffer.lock().unwrap().iter().map(|r| r.timestamp).min())
        }

        async fn read_scalers(
            &self,
            _serial: &str,
            _obis: &ObisCode,
        ) -> Result<ScalerTable, DeviceError> {
            self.scaler_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.scalers.clone())
        }
    }

    #[async_trait::async_trait]
    impl PartialRecovery for ScriptedDevice {
        async fn recover_partial(&self, serial: &str, obis: &ObisCode) -> Vec<ProfileRow> {
            self.salvage.recover_partial(serial, obis).await
        }
    }
}

