//! Plain TCP transport.

use super::{
    IoReader, IoWriter, NetworkTransport, TransportFactory, TransportReader, TransportWriter,
};
use crate::error::{MqttError, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use url::Url;

const DEFAULT_PORT: u16 = 1883;

pub struct TcpTransport {
    uri: String,
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| MqttError::Configuration(format!("missing host in {url}")))?
            .to_string();
        Ok(Self {
            uri: url.to_string(),
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            stream: None,
        })
    }
}

#[async_trait]
impl NetworkTransport for TcpTransport {
    async fn start(&mut self) -> Result<()> {
        tracing::debug!(host = %self.host, port = self.port, "opening TCP connection");
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| MqttError::ConnectionError(format!("connect {}: {e}", self.uri)))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn split(self: Box<Self>) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)> {
        let stream = self.stream.ok_or(MqttError::NotConnected)?;
        let (read, write) = stream.into_split();
        Ok((Box::new(IoReader(read)), Box::new(IoWriter(write))))
    }

    fn server_uri(&self) -> &str {
        &self.uri
    }
}

pub struct TcpFactory;

impl TransportFactory for TcpFactory {
    fn create(&self, uri: &Url) -> Result<Box<dyn NetworkTransport>> {
        Ok(Box::new(TcpTransport::new(uri)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let url = Url::parse("tcp://broker.example.com:8883").unwrap();
        let transport = TcpTransport::new(&url).unwrap();
        assert_eq!(transport.host, "broker.example.com");
        assert_eq!(transport.port, 8883);
    }

    #[test]
    fn default_port() {
        let url = Url::parse("tcp://localhost").unwrap();
        let transport = TcpTransport::new(&url).unwrap();
        assert_eq!(transport.port, DEFAULT_PORT);
    }

    #[test]
    fn split_before_start_fails() {
        let url = Url::parse("tcp://localhost:1883").unwrap();
        let transport = Box::new(TcpTransport::new(&url).unwrap());
        assert!(transport.split().is_err());
    }

    #[tokio::test]
    async fn connects_to_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = Url::parse(&format!("tcp://127.0.0.1:{}", addr.port())).unwrap();

        let mut transport = TcpTransport::new(&url).unwrap();
        let (started, accepted) = tokio::join!(transport.start(), listener.accept());
        started.unwrap();
        accepted.unwrap();

        let (_reader, mut writer) = Box::new(transport).split().unwrap();
        writer.write_all(b"ping").await.unwrap();
        writer.shutdown().await;
    }
}
