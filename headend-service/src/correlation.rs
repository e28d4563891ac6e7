//! Request/response correlation over connection-multiplexed transport.
//!
//! Each meter has at most one outstanding request. A request moves from
//! ISSUED to exactly one of MATCHED, EXPIRED or CANCELLED, and its tracker
//! entry is gone once it leaves ISSUED. Every request carries a
//! [`ResponseMatcher`]; a frame is only delivered to the outstanding request it
//! answers. Anything else, including a late answer to an expired request, is
//! logged and dropped.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{sync::oneshot, time::Instant};

use crate::registry::{ChannelId, ConnectionRegistry};

pub type CorrelationId = u64;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("meter {0} has no bound channel")]
    NotConnected(String),
    #[error("meter {serial} already has request {outstanding} in flight")]
    RequestInFlight {
        serial: String,
        outstanding: CorrelationId,
    },
    #[error("request {id} to meter {serial} timed out after {after:?}")]
    Timeout {
        serial: String,
        id: CorrelationId,
        after: Duration,
    },
    #[error("channel to meter {serial} closed while request {id} was pending")]
    ChannelClosed { serial: String, id: CorrelationId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Issued,
    Matched,
    Expired,
    Cancelled,
}

/// What happened to an inbound application frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered(CorrelationId),
    /// Matched an entry whose deadline had already passed.
    Overdue(CorrelationId),
    Untracked,
}

/// Recognises the frame that answers one particular request, typically by the
/// invoke id the device echoes back.
#[derive(Clone)]
pub struct ResponseMatcher(Arc<dyn Fn(&[u8]) -> bool + Send + Sync>);

impl ResponseMatcher {
    pub fn new(f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, frame: &[u8]) -> bool {
        (self.0)(frame)
    }
}

impl fmt::Debug for ResponseMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseMatcher")
    }
}

struct InFlight {
    id: CorrelationId,
    channel: ChannelId,
    matcher: ResponseMatcher,
    issued_at: Instant,
    expiry_at: Instant,
    reply: oneshot::Sender<Bytes>,
}

pub struct CorrelationTracker {
    registry: Arc<ConnectionRegistry>,
    pending: DashMap<String, InFlight>,
    next_id: AtomicU64,
}

/// Clears the tracker entry when `send` finishes or its future is dropped.
struct PendingGuard<'a> {
    tracker: &'a CorrelationTracker,
    serial: &'a str,
    id: CorrelationId,
    state: RequestState,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let removed = self
            .tracker
            .pending
            .remove_if(self.serial, |_, entry| entry.id == self.id)
            .is_some();
        match self.state {
            RequestState::Matched => {}
            RequestState::Expired => {
                tracing::debug!(serial = self.serial, id = self.id, removed, "request expired");
            }
            RequestState::Cancelled | RequestState::Issued => {
                tracing::debug!(serial = self.serial, id = self.id, removed, "request cancelled");
            }
        }
    }
}

impl CorrelationTracker {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Sends `request` to the meter's bound channel and waits for a frame
    /// accepted by `matcher` or the deadline, whichever comes first.
    ///
    /// Callers must run on worker tasks; the I/O path only ever calls
    /// [`CorrelationTracker::on_frame_received`].
    pub async fn send(
        &self,
        serial: &str,
        request: Bytes,
        matcher: ResponseMatcher,
        timeout: Duration,
    ) -> Result<Bytes, CorrelationError> {
        let handle = self
            .registry
            .channel_for(serial)
            .ok_or_else(|| CorrelationError::NotConnected(serial.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let issued_at = Instant::now();
        let expiry_at = issued_at + timeout;
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(serial.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                return Err(CorrelationError::RequestInFlight {
                    serial: serial.to_string(),
                    outstanding: e.get().id,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(InFlight {
                    id,
                    channel: handle.id(),
                    matcher,
                    issued_at,
                    expiry_at,
                    reply: tx,
                });
            }
        }

        let mut guard = PendingGuard {
            tracker: self,
            serial,
            id,
            state: RequestState::Issued,
        };

        if handle.send(request).await.is_err() {
            guard.state = RequestState::Cancelled;
            return Err(CorrelationError::ChannelClosed {
                serial: serial.to_string(),
                id,
            });
        }

        match tokio::time::timeout_at(expiry_at, rx).await {
            Ok(Ok(frame)) => {
                guard.state = RequestState::Matched;
                Ok(frame)
            }
            Ok(Err(_)) => {
                guard.state = RequestState::Cancelled;
                Err(CorrelationError::ChannelClosed {
                    serial: serial.to_string(),
                    id,
                })
            }
            Err(_) => {
                guard.state = RequestState::Expired;
                metrics::counter!("correlation_timeouts_total").increment(1);
                Err(CorrelationError::Timeout {
                    serial: serial.to_string(),
                    id,
                    after: timeout,
                })
            }
        }
    }

    /// Hands an inbound application frame to whoever is waiting for it.
    /// Never fails: stray frames are logged and dropped.
    pub fn on_frame_received(&self, channel: ChannelId, frame: Bytes) -> Delivery {
        let Some(serial) = self.registry.serial_for(channel) else {
            tracing::debug!(channel, len = frame.len(), "untracked frame on unbound channel");
            metrics::counter!("correlation_untracked_total").increment(1);
            return Delivery::Untracked;
        };

        let matched = self
            .pending
            .remove_if(&serial, |_, entry| entry.matcher.matches(&frame));
        let Some((_, entry)) = matched else {
            match self.outstanding_for(&serial) {
                Some(outstanding) => tracing::debug!(
                    serial = %serial,
                    channel,
                    outstanding,
                    len = frame.len(),
                    "untracked frame, does not answer the outstanding request"
                ),
                None => tracing::debug!(
                    serial = %serial,
                    channel,
                    len = frame.len(),
                    "untracked frame, no request outstanding"
                ),
            }
            metrics::counter!("correlation_untracked_total").increment(1);
            return Delivery::Untracked;
        };

        let now = Instant::now();
        if now >= entry.expiry_at {
            tracing::warn!(
                serial = %serial,
                id = entry.id,
                late_by = ?now.duration_since(entry.expiry_at),
                "overdue response dropped"
            );
            metrics::counter!("correlation_overdue_total").increment(1);
            return Delivery::Overdue(entry.id);
        }

        let id = entry.id;
        let elapsed = now.duration_since(entry.issued_at);
        if entry.reply.send(frame).is_err() {
            // Caller went away between our lookup and delivery.
            tracing::debug!(serial = %serial, id, "response arrived for abandoned request");
            return Delivery::Untracked;
        }
        metrics::histogram!("correlation_round_trip_seconds").record(elapsed.as_secs_f64());
        Delivery::Delivered(id)
    }

    /// Cancels every request that was written to `channel`. Waiting callers
    /// observe [`CorrelationError::ChannelClosed`].
    pub fn cancel_channel(&self, channel: ChannelId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, entry| entry.channel != channel);
        let cancelled = before.saturating_sub(self.pending.len());
        if cancelled > 0 {
            tracing::debug!(channel, cancelled, "cancelled in-flight requests for closed channel");
        }
        cancelled
    }

    /// Drops entries past their deadline whose callers are no longer waiting.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending
            .retain(|_, entry| entry.expiry_at > now && !entry.reply.is_closed());
        before.saturating_sub(self.pending.len())
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn outstanding_for(&self, serial: &str) -> Option<CorrelationId> {
        self.pending.get(serial).map(|e| e.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{test_handle, RecordingSink};

    fn setup() -> (Arc<ConnectionRegistry>, Arc<CorrelationTracker>, tokio::sync::mpsc::Receiver<Bytes>) {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(RecordingSink::default()), 0));
        let (handle, rx) = test_handle(1);
        registry.register_channel(handle);
        registry.bind(1, "m1").unwrap();
        let tracker = Arc::new(CorrelationTracker::new(registry.clone()));
        (registry, tracker, rx)
    }

    /// Accepts frames that start with `tag`.
    fn answers(tag: &'static [u8]) -> ResponseMatcher {
        ResponseMatcher::new(move |frame| frame.starts_with(tag))
    }

    #[tokio::test]
    async fn matched_response_is_delivered_and_entry_cleared() {
        let (_reg, tracker, mut outbound) = setup();

        let t = tracker.clone();
        let call = tokio::spawn(async move {
            t.send("m1", Bytes::from_static(b"req"), answers(b"req:"), Duration::from_secs(5))
                .await
        });

        let sent = outbound.recv().await.unwrap();
        assert_eq!(sent.as_ref(), b"req");
        assert!(tracker.outstanding_for("m1").is_some());

        let delivery = tracker.on_frame_received(1, Bytes::from_static(b"req:resp"));
        assert!(matches!(delivery, Delivery::Delivered(_)));

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.as_ref(), b"req:resp");
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_frame_is_untracked_after_timeout() {
        let (_reg, tracker, mut outbound) = setup();

        let t = tracker.clone();
        let call = tokio::spawn(async move {
            t.send("m1", Bytes::from_static(b"req"), answers(b"req:"), Duration::from_millis(200))
                .await
        });
        outbound.recv().await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CorrelationError::Timeout { .. }));
        assert_eq!(tracker.in_flight(), 0);

        assert_eq!(
            tracker.on_frame_received(1, Bytes::from_static(b"req:late")),
            Delivery::Untracked
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_frame_never_completes_the_next_request() {
        let (_reg, tracker, mut outbound) = setup();

        let first = tracker
            .send("m1", Bytes::from_static(b"a"), answers(b"a:"), Duration::from_millis(100))
            .await;
        assert!(matches!(first, Err(CorrelationError::Timeout { .. })));
        outbound.recv().await.unwrap();

        let t = tracker.clone();
        let mut second = tokio::spawn(async move {
            t.send("m1", Bytes::from_static(b"b"), answers(b"b:"), Duration::from_secs(5))
                .await
        });
        outbound.recv().await.unwrap();
        let second_id = tracker.outstanding_for("m1").unwrap();

        // The answer to `a` shows up while `b` is outstanding.
        assert_eq!(
            tracker.on_frame_received(1, Bytes::from_static(b"a:answer")),
            Delivery::Untracked
        );
        assert_eq!(tracker.outstanding_for("m1"), Some(second_id));
        assert!(
            tokio::time::timeout(Duration::from_millis(10), &mut second)
                .await
                .is_err(),
            "request b completed with a's answer"
        );

        assert_eq!(
            tracker.on_frame_received(1, Bytes::from_static(b"b:answer")),
            Delivery::Delivered(second_id)
        );
        assert_eq!(second.await.unwrap().unwrap().as_ref(), b"b:answer");
    }

    #[tokio::test]
    async fn frame_without_request_is_untracked() {
        let (_reg, tracker, _outbound) = setup();
        assert_eq!(
            tracker.on_frame_received(1, Bytes::from_static(b"x")),
            Delivery::Untracked
        );
        assert_eq!(
            tracker.on_frame_received(99, Bytes::from_static(b"x")),
            Delivery::Untracked
        );
    }

    #[tokio::test]
    async fn expired_entry_is_dropped_as_overdue() {
        let (_reg, tracker, _outbound) = setup();
        let (tx, mut rx) = oneshot::channel();
        let issued_at = Instant::now() - Duration::from_secs(10);
        tracker.pending.insert(
            "m1".to_string(),
            InFlight {
                id: 42,
                channel: 1,
                matcher: answers(b"late"),
                issued_at,
                expiry_at: issued_at + Duration::from_secs(1),
                reply: tx,
            },
        );

        assert_eq!(
            tracker.on_frame_received(1, Bytes::from_static(b"late")),
            Delivery::Overdue(42)
        );
        assert_eq!(tracker.in_flight(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn purge_removes_abandoned_entries() {
        let (_reg, tracker, _outbound) = setup();
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let now = Instant::now();
        tracker.pending.insert(
            "m1".to_string(),
            InFlight {
                id: 7,
                channel: 1,
                matcher: answers(b""),
                issued_at: now,
                expiry_at: now + Duration::from_secs(60),
                reply: tx,
            },
        );
        assert_eq!(tracker.purge_expired(), 1);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn unbound_meter_is_not_connected() {
        let (_reg, tracker, _outbound) = setup();
        let err = tracker
            .send("nobody", Bytes::from_static(b"x"), answers(b""), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, CorrelationError::NotConnected("nobody".to_string()));
    }

    #[tokio::test]
    async fn second_concurrent_request_is_refused() {
        let (_reg, tracker, mut outbound) = setup();
        let t = tracker.clone();
        let first = tokio::spawn(async move {
            t.send("m1", Bytes::from_static(b"a"), answers(b"a:"), Duration::from_secs(5))
                .await
        });
        outbound.recv().await.unwrap();

        let err = tracker
            .send("m1", Bytes::from_static(b"b"), answers(b"b:"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CorrelationError::RequestInFlight { .. }));

        tracker.on_frame_received(1, Bytes::from_static(b"a:ok"));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn closing_channel_cancels_waiter() {
        let (_reg, tracker, mut outbound) = setup();
        let t = tracker.clone();
        let call = tokio::spawn(async move {
            t.send("m1", Bytes::from_static(b"a"), answers(b"a:"), Duration::from_secs(5))
                .await
        });
        outbound.recv().await.unwrap();

        assert_eq!(tracker.cancel_channel(1), 1);
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CorrelationError::ChannelClosed { .. }));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropped_caller_leaves_no_entry() {
        let (_reg, tracker, mut outbound) = setup();
        let t = tracker.clone();
        let call = tokio::spawn(async move {
            t.send("m1", Bytes::from_static(b"a"), answers(b"a:"), Duration::from_secs(5))
                .await
        });
        outbound.recv().await.unwrap();
        call.abort();
        let _ = call.await;

        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(
            tracker.on_frame_received(1, Bytes::from_static(b"a:late")),
            Delivery::Untracked
        );
    }
}
