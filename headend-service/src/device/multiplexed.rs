use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use profile_store::{CapturePeriod, ObisCode, ProfileRow, ScalerTable};
use time::OffsetDateTime;

use super::{
    codec::{CodecError, DeviceCodec, InvokeId, ObjectKind, RangeSelector, TypedValue},
    BlockSalvage, DeviceError, ProfileDevice,
};
use crate::{
    correlation::{CorrelationTracker, ResponseMatcher},
    registry::{ChannelId, ConnectionRegistry},
};

const CAPTURE_PERIOD_ATTR: u8 = 4;

/// Device conversations over the shared TCP multiplexer.
///
/// Every request goes through [`CorrelationTracker::send`]; callers must hold
/// the meter's lock so requests for one serial never interleave. Each GET
/// carries a fresh invoke id and only a response echoing it completes the
/// request; the association request accepts only frames without one. An
/// association is opened lazily per transport channel and dropped whenever the
/// device stops answering or reports the session invalid.
pub struct MultiplexedDevice {
    tracker: Arc<CorrelationTracker>,
    registry: Arc<ConnectionRegistry>,
    codec: Arc<dyn DeviceCodec>,
    salvage: Arc<BlockSalvage>,
    request_timeout: Duration,
    max_blocks: u32,
    associations: DashMap<String, ChannelId>,
    invoke_counter: AtomicU8,
}

impl MultiplexedDevice {
    pub fn new(
        tracker: Arc<CorrelationTracker>,
        registry: Arc<ConnectionRegistry>,
        codec: Arc<dyn DeviceCodec>,
        salvage: Arc<BlockSalvage>,
        request_timeout: Duration,
        max_blocks: u32,
    ) -> Self {
        Self {
            tracker,
            registry,
            codec,
            salvage,
            request_timeout,
            max_blocks: max_blocks.max(1),
            associations: DashMap::new(),
            invoke_counter: AtomicU8::new(0),
        }
    }

    pub fn salvage(&self) -> &Arc<BlockSalvage> {
        &self.salvage
    }

    pub fn is_associated(&self, serial: &str) -> bool {
        self.associations.contains_key(serial)
    }

    /// Forgets the device session; the next request re-establishes it.
    pub fn teardown(&self, serial: &str) {
        if self.associations.remove(serial).is_some() {
            tracing::debug!(serial, "device association torn down");
        }
    }

    fn fail(&self, serial: &str, e: DeviceError) -> DeviceError {
        if e.invalidates_session() {
            self.teardown(serial);
        }
        e
    }

    fn codec_error(&self, serial: &str, e: CodecError) -> DeviceError {
        let e = match e {
            CodecError::SessionInvalid(reason) => DeviceError::AssociationLost {
                serial: serial.to_string(),
                reason,
            },
            CodecError::AccessDenied(detail) => DeviceError::AccessDenied {
                serial: serial.to_string(),
                detail,
            },
            other => DeviceError::MalformedBlock {
                serial: serial.to_string(),
                detail: other.to_string(),
            },
        };
        self.fail(serial, e)
    }

    fn next_invoke_id(&self) -> InvokeId {
        InvokeId::new(self.invoke_counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Sends `request` and waits for the response carrying `expected`.
    async fn exchange(
        &self,
        serial: &str,
        request: Bytes,
        expected: Option<InvokeId>,
    ) -> Result<Bytes, DeviceError> {
        let codec = self.codec.clone();
        let matcher = ResponseMatcher::new(move |frame| codec.response_invoke_id(frame) == expected);
        self.tracker
            .send(serial, request, matcher, self.request_timeout)
            .await
            .map_err(|e| self.fail(serial, e.into()))
    }

    async fn ensure_association(&self, serial: &str) -> Result<(), DeviceError> {
        let channel = self
            .registry
            .session(serial)
            .map(|s| s.channel_id)
            .ok_or_else(|| DeviceError::NotConnected(serial.to_string()))?;

        if self.associations.get(serial).is_some_and(|c| *c == channel) {
            return Ok(());
        }

        let response = self
            .exchange(serial, self.codec.association_request(serial), None)
            .await?;
        self.codec
            .check_association_response(&response)
            .map_err(|e| self.codec_error(serial, e))?;

        tracing::debug!(serial, channel, "device association established");
        self.associations.insert(serial.to_string(), channel);
        Ok(())
    }

    /// Reads every block of a profile selection. With `salvage` set, each
    /// decoded block is stashed so a failure later in the transfer still
    /// leaves the completed rows recoverable.
    async fn read_blocks(
        &self,
        serial: &str,
        obis: &ObisCode,
        selector: RangeSelector,
        salvage: bool,
    ) -> Result<Vec<ProfileRow>, DeviceError> {
        self.ensure_association(serial).await?;
        if salvage {
            self.salvage.begin(serial, obis);
        }

        let mut rows = Vec::new();
        let invoke = self.next_invoke_id();
        let mut frame = self
            .exchange(serial, self.codec.profile_read_request(invoke, obis, selector), Some(invoke))
            .await?;
        let mut blocks = 0u32;

        loop {
            let block = self
                .codec
                .decode_profile_block(&frame)
                .map_err(|e| self.codec_error(serial, e))?;
            blocks += 1;
            if salvage {
                self.salvage.stash(serial, obis, &block.rows);
            }
            rows.extend(block.rows);

            if block.last_block {
                break;
            }
            if blocks >= self.max_blocks {
                return Err(DeviceError::MalformedBlock {
                    serial: serial.to_string(),
                    detail: format!("transfer exceeded {} blocks", self.max_blocks),
                });
            }
            let invoke = self.next_invoke_id();
            frame = self
                .exchange(serial, self.codec.next_block_request(invoke, block.block_number), Some(invoke))
                .await?;
        }

        if salvage {
            self.salvage.discard(serial, obis);
        }
        tracing::trace!(serial, %obis, blocks, rows = rows.len(), "profile read complete");
        Ok(rows)
    }

    /// Reads one attribute and decodes it according to the object's class.
    pub async fn read_object(
        &self,
        serial: &str,
        kind: ObjectKind,
        obis: &ObisCode,
        attribute: u8,
        scaler: i8,
    ) -> Result<TypedValue, DeviceError> {
        self.ensure_association(serial).await?;
        let invoke = self.next_invoke_id();
        let frame = self
            .exchange(
                serial,
                self.codec.attribute_request(invoke, kind.class_id(), obis, attribute),
                Some(invoke),
            )
            .await?;
        let raw = self
            .codec
            .decode_attribute(&frame)
            .map_err(|e| self.codec_error(serial, e))?;
        kind.decode(attribute, raw, scaler)
            .map_err(|e| self.codec_error(serial, e))
    }
}

#[async_trait::async_trait]
impl ProfileDevice for MultiplexedDevice {
    async fn read_range(
        &self,
        serial: &str,
        obis: &ObisCode,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<ProfileRow>, DeviceError> {
        let mut rows = self
            .read_blocks(serial, obis, RangeSelector::Time { from, to }, true)
            .await?;
        // Meters commonly include the entry just before `from`.
        rows.retain(|r| r.timestamp >= from && r.timestamp <= to);
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }

    async fn read_capture_period(
        &self,
        serial: &str,
        obis: &ObisCode,
    ) -> Result<CapturePeriod, DeviceError> {
        match self
            .read_object(serial, ObjectKind::ProfileGeneric, obis, CAPTURE_PERIOD_ATTR, 0)
            .await?
        {
            TypedValue::Period(p) => Ok(p),
            other => Err(DeviceError::MalformedBlock {
                serial: serial.to_string(),
                detail: format!("capture period decoded as {other:?}"),
            }),
        }
    }

    async fn read_buffer_start(
        &self,
        serial: &str,
        obis: &ObisCode,
    ) -> Result<Option<OffsetDateTime>, DeviceError> {
        let rows = self
            .read_blocks(serial, obis, RangeSelector::Entries { from: 1, to: 1 }, false)
            .await?;
        Ok(rows.iter().map(|r| r.timestamp).min())
    }

    async fn read_scalers(&self, serial: &str, obis: &ObisCode) -> Result<ScalerTable, DeviceError> {
        self.ensure_association(serial).await?;
        let invoke = self.next_invoke_id();
        let frame = self
            .exchange(serial, self.codec.scaler_request(invoke, obis), Some(invoke))
            .await?;
        self.codec
            .decode_scalers(&frame)
            .map_err(|e| self.codec_error(serial, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{
            testing::{reply, spawn_meter, FakeRequest, FakeResponse, JsonCodec},
            PartialRecovery,
        },
        correlation::Delivery,
        registry::tests::{test_handle, RecordingSink},
    };
    use profile_store::RawValue;
    use std::sync::Mutex;
    use time::macros::datetime;

    const LOAD: ObisCode = ObisCode::new(1, 0, 99, 1, 0, 255);

    type Log = Arc<Mutex<Vec<FakeRequest>>>;

    fn row(ts: OffsetDateTime, kwh: u64) -> ProfileRow {
        ProfileRow::new(ts).with_value("1.0.1.8.0.255", RawValue::Unsigned(kwh))
    }

    fn setup<F>(script: F) -> (MultiplexedDevice, Log)
    where
        F: FnMut(&FakeRequest) -> Option<FakeResponse> + Send + 'static,
    {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(RecordingSink::default()), 0));
        let (handle, outbound) = test_handle(1);
        registry.register_channel(handle);
        registry.bind(1, "m1").unwrap();
        let tracker = Arc::new(CorrelationTracker::new(registry.clone()));
        let log = spawn_meter(outbound, tracker.clone(), 1, script);
        let device = MultiplexedDevice::new(
            tracker,
            registry,
            Arc::new(JsonCodec),
            Arc::new(BlockSalvage::new()),
            Duration::from_millis(200),
            16,
        );
        (device, log)
    }

    fn associations(log: &Log) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r, FakeRequest::Associate(_)))
            .count()
    }

    #[tokio::test]
    async fn reads_multi_block_range_over_one_association() {
        let (device, log) = setup(|req| match req {
            FakeRequest::Associate(_) => Some(FakeResponse::Associated),
            FakeRequest::ReadProfile { .. } => Some(FakeResponse::Block {
                number: 1,
                last: false,
                rows: vec![
                    // Boundary entry before `from` is filtered out.
                    row(datetime!(2024-01-01 23:45 UTC), 9),
                    row(datetime!(2024-01-02 00:00 UTC), 10),
                ],
            }),
            FakeRequest::NextBlock(1) => Some(FakeResponse::Block {
                number: 2,
                last: true,
                rows: vec![row(datetime!(2024-01-02 00:15 UTC), 11)],
            }),
            _ => None,
        });

        let from = datetime!(2024-01-02 00:00 UTC);
        let to = datetime!(2024-01-02 01:00 UTC);
        let rows = device.read_range("m1", &LOAD, from, to).await.unwrap();
        assert_eq!(
            rows.iter().map(|r| r.timestamp).collect::<Vec<_>>(),
            vec![datetime!(2024-01-02 00:00 UTC), datetime!(2024-01-02 00:15 UTC)]
        );

        device.read_range("m1", &LOAD, from, to).await.unwrap();
        assert_eq!(associations(&log), 1);
        assert!(device.salvage().recover_partial("m1", &LOAD).await.is_empty());
    }

    #[tokio::test]
    async fn failed_transfer_leaves_completed_blocks_for_recovery() {
        let (device, _log) = setup(|req| match req {
            FakeRequest::Associate(_) => Some(FakeResponse::Associated),
            FakeRequest::ReadProfile { .. } => Some(FakeResponse::Block {
                number: 1,
                last: false,
                rows: vec![
                    row(datetime!(2024-01-02 00:00 UTC), 1),
                    row(datetime!(2024-01-02 00:30 UTC), 2),
                ],
            }),
            FakeRequest::NextBlock(_) => Some(FakeResponse::Garbage),
            _ => None,
        });

        let err = device
            .read_range(
                "m1",
                &LOAD,
                datetime!(2024-01-02 00:00 UTC),
                datetime!(2024-01-02 03:00 UTC),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::MalformedBlock { .. }));
        assert_eq!(device.salvage().recover_partial("m1", &LOAD).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_drops_association_and_next_call_reopens_it() {
        let mut answered = false;
        let (device, log) = setup(move |req| match req {
            FakeRequest::Associate(_) => Some(FakeResponse::Associated),
            FakeRequest::Scalers(_) if !answered => {
                answered = true;
                None
            }
            FakeRequest::Scalers(_) => Some(FakeResponse::Scalers(
                [("1.0.1.8.0.255".to_string(), -3)].into_iter().collect(),
            )),
            _ => None,
        });

        let err = device.read_scalers("m1", &LOAD).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { .. }));
        assert!(!device.is_associated("m1"));

        let scalers = device.read_scalers("m1", &LOAD).await.unwrap();
        assert_eq!(scalers.get("1.0.1.8.0.255"), Some(&-3));
        assert_eq!(associations(&log), 2);
    }

    async fn until_outstanding(device: &MultiplexedDevice) {
        while device.tracker.outstanding_for("m1").is_none() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_answer_is_not_taken_for_the_reassociation() {
        let mut associations = 0;
        let (device, _log) = setup(move |req| match req {
            FakeRequest::Associate(_) => {
                associations += 1;
                (associations == 1).then_some(FakeResponse::Associated)
            }
            _ => None,
        });
        let device = Arc::new(device);
        let scalers: ScalerTable = [("1.0.1.8.0.255".to_string(), -3)].into_iter().collect();

        let err = device.read_scalers("m1", &LOAD).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { .. }));

        let d = device.clone();
        let retry = tokio::spawn(async move { d.read_scalers("m1", &LOAD).await });
        until_outstanding(&device).await;

        // The first scalers request went out with invoke id 0.
        let late = reply(Some(0), &FakeResponse::Scalers(scalers.clone()));
        assert_eq!(device.tracker.on_frame_received(1, late), Delivery::Untracked);

        let associated = reply(None, &FakeResponse::Associated);
        assert!(matches!(
            device.tracker.on_frame_received(1, associated),
            Delivery::Delivered(_)
        ));

        until_outstanding(&device).await;
        let late_again = reply(Some(0), &FakeResponse::Scalers(ScalerTable::new()));
        assert_eq!(device.tracker.on_frame_received(1, late_again), Delivery::Untracked);

        let answer = reply(Some(1), &FakeResponse::Scalers(scalers.clone()));
        assert!(matches!(
            device.tracker.on_frame_received(1, answer),
            Delivery::Delivered(_)
        ));
        assert_eq!(retry.await.unwrap().unwrap(), scalers);
    }

    #[tokio::test]
    async fn invalid_session_is_association_lost() {
        let (device, _log) = setup(|req| match req {
            FakeRequest::Associate(_) => Some(FakeResponse::Associated),
            _ => Some(FakeResponse::SessionInvalid),
        });
        let err = device.read_capture_period("m1", &LOAD).await.unwrap_err();
        assert!(matches!(err, DeviceError::AssociationLost { .. }));
        assert!(!device.is_associated("m1"));
    }

    #[tokio::test]
    async fn rejected_association_is_access_denied() {
        let (device, _log) = setup(|_| Some(FakeResponse::Rejected));
        let err = device.read_scalers("m1", &LOAD).await.unwrap_err();
        assert!(matches!(err, DeviceError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn reads_capture_period_and_buffer_start() {
        let (device, log) = setup(|req| match req {
            FakeRequest::Associate(_) => Some(FakeResponse::Associated),
            FakeRequest::Attribute { class_id: 7, attribute: 4, .. } => {
                Some(FakeResponse::Value(RawValue::Unsigned(900)))
            }
            FakeRequest::ReadProfile { .. } => Some(FakeResponse::Block {
                number: 1,
                last: true,
                rows: vec![row(datetime!(2023-06-01 00:15 UTC), 0)],
            }),
            _ => None,
        });

        assert_eq!(
            device.read_capture_period("m1", &LOAD).await.unwrap(),
            CapturePeriod::from_seconds(900)
        );
        assert_eq!(
            device.read_buffer_start("m1", &LOAD).await.unwrap(),
            Some(datetime!(2023-06-01 00:15 UTC))
        );
        assert!(log.lock().unwrap().contains(&FakeRequest::ReadProfile {
            obis: LOAD.to_string(),
            selector: RangeSelector::Entries { from: 1, to: 1 },
        }));
    }

    #[tokio::test]
    async fn unknown_meter_is_not_connected() {
        let (device, log) = setup(|_| Some(FakeResponse::Associated));
        let err = device.read_scalers("ghost", &LOAD).await.unwrap_err();
        assert_eq!(err, DeviceError::NotConnected("ghost".to_string()));
        assert!(log.lock().unwrap().is_empty());
    }
}
