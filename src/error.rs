use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

/// Errors surfaced by the client engine.
///
/// The variants fall into four families: usage errors (rejected at the call
/// site, caller's responsibility), transport errors (fatal to the current
/// connection attempt, eligible for automatic reconnect), protocol errors
/// (fatal to the connection, never retried within one attempt) and resource
/// errors (the triggering operation fails atomically).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connect already in progress")]
    ConnectInProgress,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Client is closed")]
    ClientClosed,

    #[error("Client is disconnecting")]
    Disconnecting,

    #[error("Disconnect prohibited from callback")]
    DisconnectProhibited,

    #[error("Token already in use: {0}")]
    TokenInUse(String),

    #[error("Token key not found: {0}")]
    TokenNotFound(String),

    #[error("Too many in-flight messages: limit {0}")]
    MaxInflightExceeded(u16),

    #[error("Packet ID space exhausted")]
    PacketIdExhausted,

    #[error("Offline buffer is full")]
    BufferFull,

    #[error("Buffered message discarded: {0}")]
    BufferDiscarded(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection refused by broker: return code {0}")]
    ConnectionRefused(u8),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Subscription failed: return code {0}")]
    SubscriptionFailed(u8),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation incomplete")]
    Incomplete,

    #[error("Timeout")]
    Timeout,

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MqttError {
    /// Whether the error invalidates the whole connection (as opposed to a
    /// single request) and is eligible for automatic reconnect.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionError(_)
                | Self::ConnectionLost(_)
                | Self::ProtocolError(_)
                | Self::MalformedPacket(_)
                | Self::KeepAliveTimeout
        )
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            MqttError::TokenInUse("Pub:7".into()).to_string(),
            "Token already in use: Pub:7"
        );
        assert_eq!(
            MqttError::ConnectionRefused(5).to_string(),
            "Connection refused by broker: return code 5"
        );
        assert_eq!(MqttError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn io_errors_convert_and_classify() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: MqttError = io.into();
        assert!(matches!(err, MqttError::Io(ref m) if m.contains("reset")));
        assert!(err.is_connection_fatal());
        assert!(!MqttError::TokenInUse("Con".into()).is_connection_fatal());
        assert!(!MqttError::BufferFull.is_connection_fatal());
    }
}
