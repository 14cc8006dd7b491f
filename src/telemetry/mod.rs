//! Telemetry delivery: payload assembly and validation, broker connection
//! management, publish retry and background publishing.

pub mod config;
pub mod mqtt;
pub mod payload;
pub mod publisher;
pub mod transport;
pub mod worker;

pub use config::{ConnectionConfig, TopicHash, TopicHashes, TopicSegment};
pub use mqtt::MqttTransport;
pub use payload::{CombinedPayload, DerivedField, PayloadAssembler, PayloadConfig, ValidationError, TIMESTAMP_FORMAT};
pub use publisher::{
    next_backoff, ConnectionPhase, ConnectionState, ConnectionStatusReport, PublisherHandle, PublisherOptions,
    Sleeper, TelemetryPublisher, ThreadSleeper, INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY,
};
pub use transport::{DisconnectReason, LogTransport, Transport, TransportError};
pub use worker::{TelemetryWorker, WorkerStats};
