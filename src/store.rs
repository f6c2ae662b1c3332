//! Persistence seam for in-flight and buffered messages.
//!
//! The persisted set at any time is exactly the set of messages whose
//! delivery outcome is not yet durably known. Records are written before the
//! corresponding bytes reach the wire (outbound QoS > 0) or before an inbound
//! QoS 2 publish is acknowledged, and removed when the handshake reaches its
//! terminal step.

use crate::error::{MqttError, Result};
use crate::packet::Packet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prefix for an outbound QoS > 0 publish awaiting its handshake.
pub const KEY_PREFIX_SENT: &str = "s-";
/// Prefix for an inbound QoS 2 receipt marker (PUBREC sent, PUBREL pending).
pub const KEY_PREFIX_RECEIVED: &str = "r-";
/// Prefix for a message buffered while disconnected.
pub const KEY_PREFIX_BUFFERED: &str = "sb-";

#[must_use]
pub fn sent_key(packet_id: u16) -> String {
    format!("{KEY_PREFIX_SENT}{packet_id}")
}

#[must_use]
pub fn received_key(packet_id: u16) -> String {
    format!("{KEY_PREFIX_RECEIVED}{packet_id}")
}

#[must_use]
pub fn buffered_key(seq: u64) -> String {
    format!("{KEY_PREFIX_BUFFERED}{seq}")
}

/// Outbound handshake stage recorded with the persisted message, so replay
/// after a reconnect resumes from the right step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeStage {
    /// PUBLISH sent (or not yet sent); PUBACK/PUBREC outstanding.
    Publish,
    /// QoS 2 only: PUBREC received, PUBREL sent or due; PUBCOMP outstanding.
    PubRel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub packet: Packet,
    pub stage: HandshakeStage,
}

impl PersistedRecord {
    #[must_use]
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            stage: HandshakeStage::Publish,
        }
    }
}

/// Durable key/value store for messages that must survive a crash between
/// send and acknowledgement. At most one engine instance accesses a store at
/// a time; the engine owns the only handle.
pub trait MessageStore: Send + Sync {
    /// Binds the store to one client/broker identity before first use.
    fn open(&self, client_id: &str, server_uri: &str) -> Result<()>;
    fn put(&self, key: &str, record: PersistedRecord) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<PersistedRecord>>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
    /// Discards every record; used when a clean session starts.
    fn clear(&self) -> Result<()>;
    fn close(&self);
}

/// In-memory store. Does not survive a process restart; suitable for clean
/// sessions and tests. Durable backends implement [`MessageStore`] outside
/// this crate.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, PersistedRecord>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    fn open(&self, _client_id: &str, _server_uri: &str) -> Result<()> {
        Ok(())
    }

    fn put(&self, key: &str, record: PersistedRecord) -> Result<()> {
        self.records.lock().insert(key.to_string(), record);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<PersistedRecord>> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.records.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.records.lock().keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        self.records.lock().clear();
        Ok(())
    }

    fn close(&self) {}
}

/// A store wrapper that fails every write, for exercising the atomic-failure
/// path of `send`.
#[doc(hidden)]
#[derive(Default)]
pub struct FailingStore;

impl MessageStore for FailingStore {
    fn open(&self, _client_id: &str, _server_uri: &str) -> Result<()> {
        Ok(())
    }

    fn put(&self, key: &str, _record: PersistedRecord) -> Result<()> {
        Err(MqttError::Persistence(format!("write refused: {key}")))
    }

    fn get(&self, _key: &str) -> Result<Option<PersistedRecord>> {
        Ok(None)
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}
}
