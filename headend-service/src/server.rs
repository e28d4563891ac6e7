//! TCP listener: one task per meter connection.
//!
//! The read side only classifies frames, answers handshakes with a
//! non-blocking queue push and hands application frames to the correlation
//! tracker. Nothing on this path waits on a device.

use std::{io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::{mpsc, watch},
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    config::ListenerConfig,
    correlation::{CorrelationTracker, Delivery},
    registry::{ChannelHandle, ChannelId, ConnectionRegistry},
    wrapper::{classify, FrameKind, HandshakeFrame, HandshakeKind, WrapperFrameCodec},
};

/// What the I/O path did with one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Handshake { kind: HandshakeKind, serial: String },
    Application(Delivery),
    Dropped(&'static str),
}

fn dropped(reason: &'static str) -> Dispatch {
    metrics::counter!("wrapper_frames_dropped_total", "reason" => reason).increment(1);
    Dispatch::Dropped(reason)
}

/// Handles one complete inbound frame. Never blocks.
pub fn dispatch(
    registry: &ConnectionRegistry,
    tracker: &CorrelationTracker,
    channel: ChannelId,
    frame: Bytes,
) -> Dispatch {
    registry.record_inbound(channel, frame.clone());

    match classify(&frame) {
        FrameKind::Login | FrameKind::Heartbeat => {
            let handshake = match HandshakeFrame::parse(&frame) {
                Ok(h) => h,
                Err(e) => {
                    // No response: the meter retries.
                    tracing::debug!(channel, error = %e, "dropping malformed handshake");
                    return dropped("malformed_handshake");
                }
            };
            let response = match handshake.response() {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(channel, error = %e, "cannot build handshake response");
                    return dropped("unanswerable_handshake");
                }
            };

            let serial = handshake.meter_id().to_string();
            if let Err(e) = registry.bind(channel, &serial) {
                tracing::warn!(channel, serial = %serial, error = %e, "handshake on unregistered channel");
                return dropped("unregistered_channel");
            }

            let kind = handshake.kind();
            match registry.handle(channel).map(|h| h.try_send(Bytes::from(response))) {
                Some(Ok(())) => {
                    let label = match kind {
                        HandshakeKind::Login => "login",
                        HandshakeKind::Heartbeat => "heartbeat",
                    };
                    metrics::counter!("handshake_responses_total", "kind" => label).increment(1);
                }
                Some(Err(e)) => {
                    tracing::warn!(channel, serial = %serial, error = %e, "handshake response not queued");
                }
                None => {}
            }
            Dispatch::Handshake { kind, serial }
        }
        FrameKind::Application => Dispatch::Application(tracker.on_frame_received(channel, frame)),
        FrameKind::Invalid => {
            tracing::debug!(channel, len = frame.len(), "dropping short frame");
            dropped("too_short")
        }
    }
}

pub struct HeadEndServer {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<CorrelationTracker>,
    max_frame_len: usize,
    outbound_queue: usize,
}

impl HeadEndServer {
    pub async fn bind(
        cfg: &ListenerConfig,
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<CorrelationTracker>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(&cfg.bind_addr).await?;
        Ok(Self {
            listener,
            registry,
            tracker,
            max_frame_len: cfg.max_frame_len,
            outbound_queue: cfg.outbound_queue.max(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "head-end listener started");
        let mut next_channel: ChannelId = 1;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let channel = next_channel;
                    next_channel += 1;

                    let connection = Connection {
                        channel,
                        peer,
                        registry: self.registry.clone(),
                        tracker: self.tracker.clone(),
                        max_frame_len: self.max_frame_len,
                        outbound_queue: self.outbound_queue,
                    };
                    tokio::spawn(connection.serve(stream));
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("head-end listener stopped");
        Ok(())
    }
}

struct Connection {
    channel: ChannelId,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<CorrelationTracker>,
    max_frame_len: usize,
    outbound_queue: usize,
}

impl Connection {
    async fn serve(self, stream: TcpStream) {
        let Connection {
            channel,
            peer,
            registry,
            tracker,
            max_frame_len,
            outbound_queue,
        } = self;

        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(outbound_queue);
        registry.register_channel(ChannelHandle::new(channel, peer, tx));
        metrics::gauge!("headend_connections").increment(1.0);
        tracing::debug!(channel, %peer, "connection accepted");

        let writer = tokio::spawn(write_loop(
            channel,
            FramedWrite::new(write_half, WrapperFrameCodec::new(max_frame_len)),
            rx,
        ));

        let mut frames = FramedRead::new(read_half, WrapperFrameCodec::new(max_frame_len));
        while let Some(next) = frames.next().await {
            match next {
                Ok(frame) => {
                    dispatch(&registry, &tracker, channel, frame);
                }
                Err(e) => {
                    tracing::warn!(channel, %peer, error = %e, "closing connection on framing error");
                    break;
                }
            }
        }

        tracker.cancel_channel(channel);
        let session = registry.unbind(channel);
        writer.abort();
        metrics::gauge!("headend_connections").decrement(1.0);
        tracing::debug!(
            channel,
            %peer,
            serial = session.as_ref().map(|s| s.meter_serial.as_str()),
            "connection closed"
        );
    }
}

async fn write_loop(
    channel: ChannelId,
    mut sink: FramedWrite<OwnedWriteHalf, WrapperFrameCodec>,
    mut outbound: mpsc::Receiver<Bytes>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(channel, error = %e, "write failed, stopping writer");
            break;
        }
    }
}
