//! Shared harness: a JSON wire codec, the in-memory broker pair and an
//! event-collecting handler.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use mqttc::transport::mock::{self, BrokerConn, MockBroker, MockFactory};
use mqttc::{
    ConnAckPacket, EventHandler, Message, MqttClient, MqttError, Packet, PacketCodec, Result,
    Token,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Length-prefixed JSON framing. The engine never looks at bytes, so any
/// complete codec works for exercising it.
pub struct JsonCodec;

impl PacketCodec for JsonCodec {
    fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> Result<()> {
        let body =
            serde_json::to_vec(packet).map_err(|e| MqttError::MalformedPacket(e.to_string()))?;
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);
        let body = src.split_to(len);
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| MqttError::MalformedPacket(e.to_string()))
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A client wired to an in-memory broker. The returned factory can be used
/// to make connection attempts fail.
pub fn harness() -> (MqttClient, MockBroker, Arc<MockFactory>) {
    init_tracing();
    let codec: Arc<dyn PacketCodec> = Arc::new(JsonCodec);
    let (broker, factory) = mock::broker(codec.clone());
    let client = MqttClient::new(codec);
    client.register_transport("mock", factory.clone());
    (client, broker, factory)
}

pub const BROKER_URI: &str = "mock://broker";

/// Broker side of a successful connect: accept, check CONNECT, answer
/// CONNACK.
pub async fn accept_and_connack(broker: &mut MockBroker, session_present: bool) -> BrokerConn {
    let mut conn = broker.accept().await.expect("no connection attempt");
    let packet = conn.recv().await.expect("no CONNECT");
    assert!(matches!(packet, Packet::Connect(_)), "got {packet:?}");
    conn.send(&Packet::ConnAck(ConnAckPacket {
        session_present,
        return_code: 0,
    }))
    .await
    .expect("CONNACK send failed");
    conn
}

/// Client-plus-broker side of one successful connect. The token is awaited
/// only after the broker has answered, since it resolves on CONNACK.
pub async fn connect(
    client: &MqttClient,
    broker: &mut MockBroker,
    options: mqttc::ConnectOptions,
) -> BrokerConn {
    let token = client.connect(options).expect("connect rejected");
    let conn = accept_and_connack(broker, false).await;
    token.wait().await.expect("connect failed");
    conn
}

/// Event handler that records everything it sees.
#[derive(Default)]
pub struct Events {
    pub messages: Mutex<Vec<Message>>,
    pub delivered: Mutex<Vec<Token>>,
    pub lost: Mutex<Vec<MqttError>>,
    pub connected: Mutex<Vec<String>>,
}

impl Events {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Polls until `pred` holds, failing the test after five seconds.
    pub async fn wait_until(&self, mut pred: impl FnMut(&Self) -> bool) {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if pred(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "condition not reached within 5s");
    }
}

#[async_trait]
impl EventHandler for Events {
    async fn message_arrived(&self, message: Message) {
        self.messages.lock().push(message);
    }

    async fn delivery_complete(&self, token: Token) {
        self.delivered.lock().push(token);
    }

    async fn connection_lost(&self, cause: MqttError) {
        self.lost.lock().push(cause);
    }

    async fn connected(&self, server_uri: String) {
        self.connected.lock().push(server_uri);
    }
}
