use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::Bytes;
use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};

pub type ChannelId = u64;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),
    #[error("outbound queue of channel {0} is full")]
    QueueFull(ChannelId),
}

/// Write side of one accepted transport connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    peer: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
}

impl ChannelHandle {
    pub fn new(id: ChannelId, peer: SocketAddr, outbound: mpsc::Sender<Bytes>) -> Self {
        Self { id, peer, outbound }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues a frame, waiting for queue space. For worker tasks.
    pub async fn send(&self, frame: Bytes) -> Result<(), RegistryError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| RegistryError::ChannelClosed(self.id))
    }

    /// Queues a frame without waiting. For the I/O path.
    pub fn try_send(&self, frame: Bytes) -> Result<(), RegistryError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RegistryError::QueueFull(self.id),
            mpsc::error::TrySendError::Closed(_) => RegistryError::ChannelClosed(self.id),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterSession {
    pub meter_serial: String,
    pub channel_id: ChannelId,
    pub bound_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub meter_serial: String,
    pub status: MeterStatus,
    pub at: OffsetDateTime,
}

/// Receiver of ONLINE/OFFLINE transitions. Must not block.
pub trait StatusSink: Send + Sync {
    fn publish(&self, event: StatusEvent);
}

/// Fans status events out to any number of subscribers.
pub struct BroadcastStatusSink {
    tx: broadcast::Sender<StatusEvent>,
}

impl BroadcastStatusSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl StatusSink for BroadcastStatusSink {
    fn publish(&self, event: StatusEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// First binding for this serial.
    Bound,
    /// The serial moved here from another channel (meter reconnected).
    Rebound { previous: ChannelId },
    /// Channel was already bound to this serial.
    Unchanged,
}

struct ChannelEntry {
    handle: ChannelHandle,
    recent: VecDeque<Bytes>,
}

#[derive(Default)]
struct Bindings {
    by_channel: HashMap<ChannelId, String>,
    by_serial: HashMap<String, MeterSession>,
}

/// Channel <-> meter serial map shared by the listener and device workers.
///
/// At most one channel is bound to a serial at any instant; a new login for a
/// serial supersedes the previous binding.
pub struct ConnectionRegistry {
    channels: DashMap<ChannelId, ChannelEntry>,
    bindings: RwLock<Bindings>,
    status: Arc<dyn StatusSink>,
    frame_history: usize,
}

impl ConnectionRegistry {
    pub fn new(status: Arc<dyn StatusSink>, frame_history: usize) -> Self {
        Self {
            channels: DashMap::new(),
            bindings: RwLock::new(Bindings::default()),
            status,
            frame_history,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Bindings> {
        self.bindings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Bindings> {
        self.bindings.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, serial: String, status: MeterStatus) {
        tracing::info!(serial = %serial, ?status, "meter status changed");
        self.status.publish(StatusEvent {
            meter_serial: serial,
            status,
            at: OffsetDateTime::now_utc(),
        });
    }

    pub fn register_channel(&self, handle: ChannelHandle) {
        self.channels.insert(
            handle.id(),
            ChannelEntry {
                handle,
                recent: VecDeque::with_capacity(self.frame_history),
            },
        );
    }

    pub fn bind(&self, channel: ChannelId, serial: &str) -> Result<BindOutcome, RegistryError> {
        if !self.channels.contains_key(&channel) {
            return Err(RegistryError::UnknownChannel(channel));
        }

        let mut events = Vec::new();
        let outcome = {
            let mut b = self.write();

            match b.by_channel.get(&channel) {
                Some(current) if current == serial => return Ok(BindOutcome::Unchanged),
                Some(other) => {
                    // Same socket now claims a different identity.
                    let other = other.clone();
                    if b.by_serial.get(&other).map(|s| s.channel_id) == Some(channel) {
                        b.by_serial.remove(&other);
                        events.push((other, MeterStatus::Offline));
                    }
                }
                None => {}
            }

            let previous = b
                .by_serial
                .get(serial)
                .map(|s| s.channel_id)
                .filter(|id| *id != channel);
            if let Some(previous) = previous {
                b.by_channel.remove(&previous);
            }

            b.by_channel.insert(channel, serial.to_string());
            b.by_serial.insert(
                serial.to_string(),
                MeterSession {
                    meter_serial: serial.to_string(),
                    channel_id: channel,
                    bound_at: OffsetDateTime::now_utc(),
                },
            );
            events.push((serial.to_string(), MeterStatus::Online));

            match previous {
                Some(previous) => BindOutcome::Rebound { previous },
                None => BindOutcome::Bound,
            }
        };

        if let BindOutcome::Rebound { previous } = outcome {
            tracing::info!(serial, previous, channel, "meter binding superseded by new channel");
        }
        for (serial, status) in events {
            self.emit(serial, status);
        }
        Ok(outcome)
    }

    /// Forgets a closed channel. Emits OFFLINE only if the channel still owned
    /// its serial; a superseded channel closing is silent.
    pub fn unbind(&self, channel: ChannelId) -> Option<MeterSession> {
        self.channels.remove(&channel);

        let session = {
            let mut b = self.write();
            let serial = b.by_channel.remove(&channel)?;
            match b.by_serial.get(&serial) {
                Some(s) if s.channel_id == channel => b.by_serial.remove(&serial),
                _ => None,
            }
        };

        if let Some(s) = &session {
            self.emit(s.meter_serial.clone(), MeterStatus::Offline);
        }
        session
    }

    pub fn serial_for(&self, channel: ChannelId) -> Option<String> {
        self.read().by_channel.get(&channel).cloned()
    }

    pub fn channel_for(&self, serial: &str) -> Option<ChannelHandle> {
        let channel = self.read().by_serial.get(serial).map(|s| s.channel_id)?;
        self.channels.get(&channel).map(|e| e.handle.clone())
    }

    pub fn handle(&self, channel: ChannelId) -> Option<ChannelHandle> {
        self.channels.get(&channel).map(|e| e.handle.clone())
    }

    pub fn session(&self, serial: &str) -> Option<MeterSession> {
        self.read().by_serial.get(serial).cloned()
    }

    pub fn online_serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.read().by_serial.keys().cloned().collect();
        serials.sort();
        serials
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Keeps the last few inbound frames per channel for diagnostics.
    pub fn record_inbound(&self, channel: ChannelId, frame: Bytes) {
        if self.frame_history == 0 {
            return;
        }
        if let Some(mut entry) = self.channels.get_mut(&channel) {
            if entry.recent.len() == self.frame_history {
                entry.recent.pop_front();
            }
            entry.recent.push_back(frame);
        }
    }

    pub fn recent_frames(&self, channel: ChannelId) -> Vec<Bytes> {
        self.channels
            .get(&channel)
            .map(|e| e.recent.iter().cloned().collect())
            .unwrap_or_default()
    }
}
