//! In-memory transport pair for tests.
//!
//! The factory side plugs into a [`TransportRegistry`](super::TransportRegistry)
//! under the `mock` scheme; the broker side lets a test script CONNACK/ack
//! behavior at the packet level. Dropping a [`BrokerConn`] closes the stream,
//! which the client observes as a lost connection.

use super::{
    IoReader, IoWriter, NetworkTransport, TransportFactory, TransportReader, TransportWriter,
};
use crate::codec::PacketCodec;
use crate::error::{MqttError, Result};
use crate::packet::Packet;
use bytes::BytesMut;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use url::Url;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Creates a broker endpoint and the factory that connects clients to it.
pub fn broker(codec: Arc<dyn PacketCodec>) -> (MockBroker, Arc<MockFactory>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MockBroker { accepted: rx },
        Arc::new(MockFactory {
            accepted: tx,
            codec,
            reject_next: AtomicUsize::new(0),
        }),
    )
}

pub struct MockFactory {
    accepted: mpsc::UnboundedSender<BrokerConn>,
    codec: Arc<dyn PacketCodec>,
    reject_next: AtomicUsize,
}

impl MockFactory {
    /// Makes the next `n` connection attempts fail, for reconnect/backoff
    /// tests.
    pub fn reject_next(&self, n: usize) {
        self.reject_next.store(n, Ordering::SeqCst);
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, uri: &Url) -> Result<Box<dyn NetworkTransport>> {
        let pending = self.reject_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.reject_next.store(pending - 1, Ordering::SeqCst);
            return Err(MqttError::ConnectionError("mock connect refused".into()));
        }

        let (client_end, broker_end) = duplex(PIPE_CAPACITY);
        self.accepted
            .send(BrokerConn {
                stream: broker_end,
                buf: BytesMut::new(),
                codec: self.codec.clone(),
            })
            .map_err(|_| MqttError::ConnectionError("mock broker gone".into()))?;

        Ok(Box::new(MockTransport {
            uri: uri.to_string(),
            stream: Some(client_end),
        }))
    }
}

pub struct MockBroker {
    accepted: mpsc::UnboundedReceiver<BrokerConn>,
}

impl MockBroker {
    /// Waits for the next client connection attempt.
    pub async fn accept(&mut self) -> Option<BrokerConn> {
        self.accepted.recv().await
    }
}

/// The broker's side of one accepted connection.
pub struct BrokerConn {
    stream: DuplexStream,
    buf: BytesMut,
    codec: Arc<dyn PacketCodec>,
}

impl BrokerConn {
    pub async fn recv(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = self.codec.decode(&mut self.buf)? {
                return Ok(packet);
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(MqttError::ConnectionLost("client closed".into()));
            }
        }
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        let mut out = BytesMut::new();
        self.codec.encode(packet, &mut out)?;
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Drops the connection, which the client sees as a stream closure.
    pub fn close(self) {}
}

pub struct MockTransport {
    uri: String,
    stream: Option<DuplexStream>,
}

#[async_trait::async_trait]
impl NetworkTransport for MockTransport {
    async fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            Ok(())
        } else {
            Err(MqttError::NotConnected)
        }
    }

    fn split(self: Box<Self>) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)> {
        let stream = self.stream.ok_or(MqttError::NotConnected)?;
        let (read, write) = tokio::io::split(stream);
        Ok((Box::new(IoReader(read)), Box::new(IoWriter(write))))
    }

    fn server_uri(&self) -> &str {
        &self.uri
    }
}
