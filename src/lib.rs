//! Asynchronous MQTT client engine with QoS 0/1/2 delivery guarantees.
//!
//! The crate is organized around two cooperating halves:
//!
//! - a **connection lifecycle** state machine ([`MqttClient`] and its
//!   internals) that owns connect/disconnect/close transitions, per-connection
//!   worker tasks, keep-alive probing and automatic reconnect with
//!   exponential backoff;
//! - a **delivery engine** that owns the packet-id space, acknowledgement
//!   handshakes for both directions, persistence of unfinished handshakes and
//!   the offline send buffer.
//!
//! Wire encoding is pluggable through [`PacketCodec`], persistence through
//! [`MessageStore`], and the network through [`transport::TransportFactory`],
//! so the delivery semantics can be tested and reused independently of any
//! particular broker, socket type or serialization.
//!
//! Every operation returns a [`Token`]; await it for the outcome:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn run(codec: Arc<dyn mqttc::PacketCodec>) -> mqttc::Result<()> {
//! use mqttc::{ConnectOptions, MqttClient, QoS};
//!
//! let client = MqttClient::new(codec);
//! client
//!     .connect(ConnectOptions::new("demo", "tcp://localhost:1883"))?
//!     .wait()
//!     .await?;
//! client
//!     .publish("greetings", b"hello".to_vec(), QoS::ExactlyOnce, false)?
//!     .wait()
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod buffer;
mod client;
mod codec;
mod dispatcher;
mod engine;
mod error;
mod keepalive;
mod packet;
mod store;
mod token;
pub mod transport;
mod types;

pub use client::MqttClient;
pub use codec::PacketCodec;
pub use dispatcher::EventHandler;
pub use error::{MqttError, Result};
pub use packet::{
    ConnAckPacket, ConnectPacket, Packet, PublishPacket, SubAckPacket, SubscribePacket,
    UnsubscribePacket,
};
pub use store::{HandshakeStage, MemoryStore, MessageStore, PersistedRecord};
pub use token::Token;
pub use types::{BufferConfig, ConnectOptions, Message, QoS, ReconnectConfig};
