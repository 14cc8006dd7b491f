//! Broker transport abstraction.
//!
//! The publisher owns the connection state machine; a [`Transport`] only
//! moves bytes. Event callbacks (connected, disconnected, inbound message)
//! are delivered by calling the publisher's `handle_*` methods from the
//! transport's own I/O thread.

use std::fmt;
use std::sync::Mutex;

use thiserror::Error;

use super::config::ConnectionConfig;

/// Failures reported by a transport or by the publish retry loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection to {broker} failed: {reason}")]
    ConnectFailed { broker: String, reason: String },

    #[error("connection refused by broker: {0}")]
    Refused(DisconnectReason),

    #[error("publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("publish to {topic} gave up after {attempts} attempts")]
    RetriesExhausted { topic: String, attempts: u32 },
}

/// Reason codes reported by the broker on connect refusal or disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    Clean,
    ProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    NetworkError,
    Timeout,
    Unknown(i32),
}

impl DisconnectReason {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Clean,
            1 => Self::ProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadCredentials,
            5 => Self::NotAuthorized,
            7 => Self::NetworkError,
            8 => Self::Timeout,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::ProtocolVersion => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadCredentials => 4,
            Self::NotAuthorized => 5,
            Self::NetworkError => 7,
            Self::Timeout => 8,
            Self::Unknown(code) => *code,
        }
    }

    /// A clean disconnect was requested by us and never triggers reconnection.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "clean disconnect"),
            Self::ProtocolVersion => write!(f, "incorrect protocol version"),
            Self::IdentifierRejected => write!(f, "client identifier rejected"),
            Self::ServerUnavailable => write!(f, "server unavailable"),
            Self::BadCredentials => write!(f, "bad username or password"),
            Self::NotAuthorized => write!(f, "not authorised"),
            Self::NetworkError => write!(f, "network error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Unknown(code) => write!(f, "unknown code {}", code),
        }
    }
}

/// Byte-level connection to a message broker.
///
/// Methods take `&self` because the publisher calls them from the frame
/// thread, the telemetry worker and the reconnection thread concurrently.
pub trait Transport: Send + Sync {
    /// Open a session. `Ok` means the broker accepted it; the publisher
    /// then marks itself connected, so transports never report the initial
    /// connect through `handle_connected`.
    fn connect(&self, config: &ConnectionConfig) -> Result<(), TransportError>;

    /// Re-establish a dropped connection using the settings from `connect`.
    /// Same contract as `connect` for the return value.
    fn reconnect(&self) -> Result<(), TransportError>;

    fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError>;

    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn disconnect(&self) -> Result<(), TransportError>;
}

/// Transport that writes every publish to the log instead of a broker.
#[derive(Debug, Default)]
pub struct LogTransport {
    broker: Mutex<Option<String>>,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for LogTransport {
    fn connect(&self, config: &ConnectionConfig) -> Result<(), TransportError> {
        let broker = config.broker_host();
        tracing::info!(broker = %broker, port = config.port(), "log transport connected");
        if let Ok(mut guard) = self.broker.lock() {
            *guard = Some(broker);
        }
        Ok(())
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        match self.broker.lock() {
            Ok(guard) if guard.is_some() => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        tracing::info!(topic, payload, "publish");
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        tracing::debug!(topic, "subscribe");
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        if let Ok(mut guard) = self.broker.lock() {
            *guard = None;
        }
        Ok(())
    }
}
