//! Byte-stream transport seam.
//!
//! A transport is a connected byte stream with a start/stop lifecycle,
//! produced by a factory keyed on the broker URI scheme. TLS and WebSocket
//! handshake mechanics stay behind this seam; the engine only ever sees the
//! split reader/writer halves. One transport belongs to exactly one
//! connection attempt and is never reused.

pub mod mock;
pub mod tcp;

use crate::error::{MqttError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

#[async_trait]
pub trait TransportReader: Send {
    /// Reads more bytes into `buf`, returning the number read; 0 means the
    /// peer closed the stream.
    async fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize>;
}

#[async_trait]
pub trait TransportWriter: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;
    /// Best-effort close of the outbound half; errors during teardown are
    /// deliberately ignored.
    async fn shutdown(&mut self);
}

#[async_trait]
pub trait NetworkTransport: Send {
    /// Establishes the connection. Must be called exactly once, before
    /// [`split`](Self::split).
    async fn start(&mut self) -> Result<()>;

    /// Consumes the transport into independently-owned read and write halves
    /// so the receiver and sender workers never contend on one handle.
    fn split(self: Box<Self>) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)>;

    fn server_uri(&self) -> &str;
}

impl std::fmt::Debug for dyn NetworkTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTransport")
            .field("server_uri", &self.server_uri())
            .finish()
    }
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, uri: &Url) -> Result<Box<dyn NetworkTransport>>;
}

/// Scheme-keyed factory registry. `tcp` is built in; `ssl`/`ws`/`wss` (or
/// anything else) are supplied by registering a factory for the scheme.
pub struct TransportRegistry {
    factories: RwLock<HashMap<String, Arc<dyn TransportFactory>>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
        };
        registry.register("tcp", Arc::new(tcp::TcpFactory));
        registry
    }

    pub fn register(&self, scheme: &str, factory: Arc<dyn TransportFactory>) {
        self.factories
            .write()
            .insert(scheme.to_ascii_lowercase(), factory);
    }

    pub fn create(&self, uri: &str) -> Result<Box<dyn NetworkTransport>> {
        let url = Url::parse(uri)
            .map_err(|e| MqttError::Configuration(format!("invalid broker URI {uri}: {e}")))?;
        let factory = self
            .factories
            .read()
            .get(url.scheme())
            .cloned()
            .ok_or_else(|| {
                MqttError::Configuration(format!("no transport for scheme {}", url.scheme()))
            })?;
        factory.create(&url)
    }
}

pub(crate) struct IoReader<R>(pub(crate) R);

#[async_trait]
impl<R: AsyncRead + Unpin + Send> TransportReader for IoReader<R> {
    async fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = self.0.read_buf(buf).await?;
        Ok(n)
    }
}

pub(crate) struct IoWriter<W>(pub(crate) W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> TransportWriter for IoWriter<W> {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.0.write_all(data).await?;
        self.0.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unknown_scheme() {
        let registry = TransportRegistry::new();
        let err = registry.create("quic://broker:1883").unwrap_err();
        assert!(matches!(err, MqttError::Configuration(_)));
    }

    #[test]
    fn registry_rejects_bad_uri() {
        let registry = TransportRegistry::new();
        assert!(matches!(
            registry.create("not a uri"),
            Err(MqttError::Configuration(_))
        ));
    }

    #[test]
    fn tcp_is_preregistered() {
        let registry = TransportRegistry::new();
        let transport = registry.create("tcp://localhost:1883").unwrap();
        assert_eq!(transport.server_uri(), "tcp://localhost:1883");
    }
}
