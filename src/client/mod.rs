//! Public client facade.

mod inner;
mod workers;

use crate::codec::PacketCodec;
use crate::dispatcher::EventHandler;
use crate::error::Result;
use crate::store::{MemoryStore, MessageStore};
use crate::token::Token;
use crate::transport::{TransportFactory, TransportRegistry};
use crate::types::{ConnectOptions, Message, QoS};
use inner::ClientCore;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Asynchronous MQTT client.
///
/// All operations return a [`Token`] immediately; await the token to learn
/// the outcome. The client is cheap to clone and fully thread-safe; clones
/// share one engine and one connection.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use mqttc::{MqttClient, ConnectOptions, QoS};
/// # async fn run(codec: Arc<dyn mqttc::PacketCodec>) -> mqttc::Result<()> {
/// let client = MqttClient::new(codec);
/// let options = ConnectOptions::new("sensor-17", "tcp://broker.local:1883");
/// client.connect(options)?.wait().await?;
/// client
///     .publish("sensors/17/temp", b"21.5".to_vec(), QoS::AtLeastOnce, false)?
///     .wait()
///     .await?;
/// client.disconnect(std::time::Duration::from_secs(10))?.wait().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MqttClient {
    core: Arc<ClientCore>,
    registry: Arc<TransportRegistry>,
}

impl MqttClient {
    /// Creates a client with an in-memory persistence store.
    #[must_use]
    pub fn new(codec: Arc<dyn PacketCodec>) -> Self {
        Self::with_store(codec, Arc::new(MemoryStore::new()))
    }

    /// Creates a client backed by a caller-supplied persistence store, so
    /// QoS > 0 handshakes survive a process restart.
    #[must_use]
    pub fn with_store(codec: Arc<dyn PacketCodec>, store: Arc<dyn MessageStore>) -> Self {
        let registry = Arc::new(TransportRegistry::new());
        Self {
            core: ClientCore::new(store, codec, registry.clone()),
            registry,
        }
    }

    /// Registers a transport factory for a URI scheme (`ssl`, `ws`, ...).
    pub fn register_transport(&self, scheme: &str, factory: Arc<dyn TransportFactory>) {
        self.registry.register(scheme, factory);
    }

    /// Installs (or clears) the application event handler.
    pub fn set_handler(&self, handler: Option<Arc<dyn EventHandler>>) {
        self.core.set_handler(handler);
    }

    #[instrument(skip(self, options), fields(client_id = %options.client_id))]
    pub fn connect(&self, options: ConnectOptions) -> Result<Token> {
        self.core.connect(options)
    }

    /// Orderly disconnect, waiting up to `timeout` for in-flight deliveries.
    ///
    /// Calling this from inside a callback fails with
    /// [`MqttError::DisconnectProhibited`](crate::MqttError::DisconnectProhibited):
    /// the callback worker cannot tear itself down.
    #[instrument(skip(self))]
    pub fn disconnect(&self, timeout: Duration) -> Result<Token> {
        self.core.disconnect(timeout)
    }

    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub fn publish(
        &self,
        topic: impl Into<String> + std::fmt::Debug,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<Token> {
        self.core.publish(Message {
            topic: topic.into(),
            payload,
            qos,
            retain,
            dup: false,
        })
    }

    /// Publishes a pre-built [`Message`].
    pub fn publish_message(&self, message: Message) -> Result<Token> {
        self.core.publish(message)
    }

    #[instrument(skip(self))]
    pub fn subscribe(&self, filter: impl Into<String> + std::fmt::Debug, qos: QoS) -> Result<Token> {
        self.core.subscribe(vec![(filter.into(), qos)])
    }

    /// Subscribes to several filters in one request; the token resolves when
    /// the broker has answered for all of them.
    pub fn subscribe_many(&self, filters: Vec<(String, QoS)>) -> Result<Token> {
        self.core.subscribe(filters)
    }

    #[instrument(skip(self))]
    pub fn unsubscribe(&self, filter: impl Into<String> + std::fmt::Debug) -> Result<Token> {
        self.core.unsubscribe(vec![filter.into()])
    }

    pub fn unsubscribe_many(&self, filters: Vec<String>) -> Result<Token> {
        self.core.unsubscribe(filters)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// The URI of the endpoint currently connected to, if any.
    #[must_use]
    pub fn server_uri(&self) -> Option<String> {
        self.core.server_uri()
    }

    /// Number of messages waiting in the offline buffer.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.core.buffered()
    }

    /// Shuts the client down for good. Only valid once disconnected: call
    /// [`disconnect`](Self::disconnect) first on a live connection, or the
    /// close fails with [`MqttError::InvalidState`](crate::MqttError::InvalidState).
    /// Issued while a disconnect is still in flight, it waits for the
    /// disconnect to finish. Idempotent. After this every operation fails
    /// with [`MqttError::ClientClosed`](crate::MqttError::ClientClosed).
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        self.core.close().await
    }
}
