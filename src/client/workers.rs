//! Per-connection background tasks.
//!
//! Each live connection runs three tasks: a sender draining the outbound
//! queue onto the write half, a receiver decoding the read half into the
//! engine, and a keep-alive timer. Whichever task dies first reports the
//! cause on the loss channel; the supervisor in `inner` tears the rest down.

use crate::codec::PacketCodec;
use crate::engine::{DeliveryEngine, Outbound};
use crate::error::MqttError;
use crate::keepalive::{KeepAlive, KeepAliveDecision};
use crate::packet::Packet;
use crate::transport::{TransportReader, TransportWriter};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) struct ConnectionTasks {
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

impl ConnectionTasks {
    pub fn abort_all(&self) {
        self.sender.abort();
        self.receiver.abort();
        self.keepalive.abort();
    }
}

pub(crate) fn spawn(
    reader: Box<dyn TransportReader>,
    writer: Box<dyn TransportWriter>,
    codec: Arc<dyn PacketCodec>,
    engine: Arc<DeliveryEngine>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    keepalive_interval: Duration,
) -> (ConnectionTasks, mpsc::UnboundedReceiver<MqttError>) {
    let (loss_tx, loss_rx) = mpsc::unbounded_channel();
    let activity = Arc::new(KeepAlive::new(keepalive_interval));

    let sender = tokio::spawn(sender_task(
        outbound_rx,
        writer,
        codec.clone(),
        activity.clone(),
        loss_tx.clone(),
    ));
    let receiver = tokio::spawn(receiver_task(
        reader,
        codec,
        engine.clone(),
        activity.clone(),
        loss_tx.clone(),
    ));
    let keepalive = tokio::spawn(keepalive_task(engine, activity, loss_tx));

    (
        ConnectionTasks {
            sender,
            receiver,
            keepalive,
        },
        loss_rx,
    )
}

async fn sender_task(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut writer: Box<dyn TransportWriter>,
    codec: Arc<dyn PacketCodec>,
    activity: Arc<KeepAlive>,
    loss: mpsc::UnboundedSender<MqttError>,
) {
    let mut buf = BytesMut::new();
    while let Some(item) = outbound.recv().await {
        buf.clear();
        let written = match codec.encode(&item.packet, &mut buf) {
            Ok(()) => writer.write_all(&buf).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                tracing::trace!(packet = item.packet.name(), "sent");
                activity.record_write();
                if let Some(token) = item.on_write {
                    token.resolve(Ok(()));
                }
            }
            Err(e) => {
                tracing::debug!(packet = item.packet.name(), error = %e, "write failed");
                if let Some(token) = item.on_write {
                    token.resolve(Err(e.clone()));
                }
                let _ = loss.send(e);
                return;
            }
        }
    }
    // Queue closed: orderly teardown.
    writer.shutdown().await;
}

async fn receiver_task(
    mut reader: Box<dyn TransportReader>,
    codec: Arc<dyn PacketCodec>,
    engine: Arc<DeliveryEngine>,
    activity: Arc<KeepAlive>,
    loss: mpsc::UnboundedSender<MqttError>,
) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(packet)) => {
                    if let Err(e) = engine.handle_packet(packet) {
                        tracing::debug!(error = %e, "inbound packet rejected");
                        let _ = loss.send(e);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = loss.send(e);
                    return;
                }
            }
        }
        match reader.read_into(&mut buf).await {
            Ok(0) => {
                let _ = loss.send(MqttError::ConnectionLost("connection closed by peer".into()));
                return;
            }
            Ok(_) => activity.record_read(),
            Err(e) => {
                let _ = loss.send(e);
                return;
            }
        }
    }
}

async fn keepalive_task(
    engine: Arc<DeliveryEngine>,
    activity: Arc<KeepAlive>,
    loss: mpsc::UnboundedSender<MqttError>,
) {
    loop {
        match activity.decision(tokio::time::Instant::now()) {
            KeepAliveDecision::Wait(d) => tokio::time::sleep(d).await,
            KeepAliveDecision::SendPing => {
                tracing::trace!("keep-alive ping");
                if engine.enqueue(Outbound::packet(Packet::PingReq)).is_err() {
                    return;
                }
                activity.record_ping_sent();
            }
            KeepAliveDecision::Timeout => {
                let _ = loss.send(MqttError::KeepAliveTimeout);
                return;
            }
        }
    }
}
