//! Public option and message types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// MQTT Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// An application message as delivered to the user callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

/// Automatic reconnect policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Next backoff delay after a failed attempt, doubled and capped.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

/// Offline buffering policy for sends issued while disconnected.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub enabled: bool,
    pub max_messages: usize,
    /// When full, evict the oldest entry instead of rejecting the new one.
    pub delete_oldest: bool,
    /// Mirror buffered messages into the persistence store (`sb-` keys).
    pub persist: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_messages: 5000,
            delete_oldest: false,
            persist: false,
        }
    }
}

/// Options for one connect attempt.
///
/// Immutable once handed to `connect`; the last-used value is what automatic
/// reconnect replays.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    /// Broker endpoints tried in order until one succeeds.
    pub server_uris: Vec<String>,
    pub clean_session: bool,
    pub keep_alive: Duration,
    /// Upper bound on concurrently unacknowledged QoS > 0 publishes.
    pub max_inflight: u16,
    /// Bounds the wait for CONNACK on each endpoint.
    pub connect_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub reconnect: ReconnectConfig,
    pub buffer: BufferConfig,
}

impl ConnectOptions {
    #[must_use]
    pub fn new(client_id: impl Into<String>, server_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            server_uris: vec![server_uri.into()],
            clean_session: true,
            keep_alive: Duration::from_secs(60),
            max_inflight: 10,
            connect_timeout: Duration::from_secs(30),
            username: None,
            password: None,
            reconnect: ReconnectConfig::default(),
            buffer: BufferConfig::default(),
        }
    }

    #[must_use]
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    #[must_use]
    pub fn with_max_inflight(mut self, max: u16) -> Self {
        self.max_inflight = max;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: &[u8]) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.to_vec());
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = buffer;
        self
    }

    #[must_use]
    pub fn with_server_uris(mut self, uris: Vec<String>) -> Self {
        self.server_uris = uris;
        self
    }
}
