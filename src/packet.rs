//! Structured control-packet values.
//!
//! The engine treats packets as opaque structured values; turning them into
//! wire bytes and back is the codec collaborator's job. Only the fields the
//! delivery engine routes on are modeled: type, packet id, and the QoS /
//! retain / dup flags of PUBLISH.

use crate::types::QoS;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectPacket {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnAckPacket {
    pub session_present: bool,
    /// 0 is success; anything else is a broker refusal.
    pub return_code: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present iff `qos > 0`.
    pub packet_id: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubAckPacket {
    pub packet_id: u16,
    /// Granted QoS per filter; 0x80 is a per-filter failure.
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck { packet_id: u16 },
    PubRec { packet_id: u16 },
    PubRel { packet_id: u16 },
    PubComp { packet_id: u16 },
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck { packet_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    #[must_use]
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::PubAck { packet_id }
            | Packet::PubRec { packet_id }
            | Packet::PubRel { packet_id }
            | Packet::PubComp { packet_id }
            | Packet::UnsubAck { packet_id } => Some(*packet_id),
            Packet::Subscribe(p) => Some(p.packet_id),
            Packet::SubAck(p) => Some(p.packet_id),
            Packet::Unsubscribe(p) => Some(p.packet_id),
            _ => None,
        }
    }

    /// The key under which the originating request's token is tracked.
    ///
    /// Only request packets have one; acknowledgements resolve the key of the
    /// request they answer.
    #[must_use]
    pub fn token_key(&self) -> Option<String> {
        match self {
            Packet::Connect(_) => Some("Con".to_string()),
            Packet::Disconnect => Some("Disc".to_string()),
            Packet::Publish(p) => p.packet_id.map(|id| publish_key(id)),
            Packet::Subscribe(p) => Some(subscribe_key(p.packet_id)),
            Packet::Unsubscribe(p) => Some(unsubscribe_key(p.packet_id)),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::PubRec { .. } => "PUBREC",
            Packet::PubRel { .. } => "PUBREL",
            Packet::PubComp { .. } => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck { .. } => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

#[must_use]
pub fn publish_key(packet_id: u16) -> String {
    format!("Pub:{packet_id}")
}

#[must_use]
pub fn subscribe_key(packet_id: u16) -> String {
    format!("Sub:{packet_id}")
}

#[must_use]
pub fn unsubscribe_key(packet_id: u16) -> String {
    format!("Unsub:{packet_id}")
}
