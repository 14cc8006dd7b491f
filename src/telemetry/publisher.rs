//! Telemetry publisher: connection state machine, publish retry and
//! background reconnection.
//!
//! ```text
//! Disconnected --start--> Connecting --ok--> Connected
//!      ^                                        |
//!      +------- unsolicited disconnect ---------+
//!      |                                        |
//!      +--- reconnect thread (1, 2, 4 .. 60) ---+
//! ```

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use super::config::ConnectionConfig;
use super::payload::{CombinedPayload, PayloadConfig};
use super::transport::{DisconnectReason, Transport, TransportError};
use crate::utils::spawn_thread;
use crate::{Error, Result};

pub const INITIAL_RECONNECT_DELAY: u64 = 1;
pub const MAX_RECONNECT_DELAY: u64 = 60;
pub const DEFAULT_PUBLISH_RETRIES: u32 = 3;

/// Next reconnection delay after a failed attempt, in time units.
pub fn next_backoff(delay: u64) -> u64 {
    delay.saturating_mul(2).min(MAX_RECONNECT_DELAY)
}

/// Blocking wait between publish attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Shared connection state, written by transport callbacks and the
/// reconnection thread.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Current reconnection delay in time units.
    pub reconnect_delay: u64,
    pub should_reconnect: bool,
    pub started: bool,
    pub last_disconnect: Option<DisconnectReason>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            reconnect_delay: INITIAL_RECONNECT_DELAY,
            should_reconnect: false,
            started: false,
            last_disconnect: None,
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }
}

/// Snapshot of the connection for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatusReport {
    pub connected: bool,
    pub phase: ConnectionPhase,
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub use_certificates: bool,
    pub reconnect_delay: u64,
    pub last_disconnect: Option<String>,
    pub reconnecting: bool,
}

/// Publisher tuning.
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// Length of one backoff time unit.
    pub time_unit: Duration,
    /// Retries after the first publish attempt.
    pub publish_retries: u32,
    pub payload: PayloadConfig,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            time_unit: Duration::from_secs(1),
            publish_retries: DEFAULT_PUBLISH_RETRIES,
            payload: PayloadConfig::default(),
        }
    }
}

struct ReconnectTask {
    cancel: Sender<()>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ConnectionConfig,
    options: PublisherOptions,
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    state: Mutex<ConnectionState>,
    reconnect: Mutex<Option<ReconnectTask>>,
}

/// Publishes telemetry to a broker through a [`Transport`].
///
/// Cloning is cheap and every clone drives the same connection; hand one to
/// the transport so it can report events through the `handle_*` methods.
#[derive(Clone)]
pub struct TelemetryPublisher {
    inner: Arc<Inner>,
}

/// Non-owning reference for transport I/O threads.
///
/// Upgrading fails once every [`TelemetryPublisher`] clone is dropped.
#[derive(Clone)]
pub struct PublisherHandle {
    inner: Weak<Inner>,
}

impl PublisherHandle {
    pub fn upgrade(&self) -> Option<TelemetryPublisher> {
        self.inner.upgrade().map(|inner| TelemetryPublisher { inner })
    }
}

impl std::fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl TelemetryPublisher {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_options(config, transport, PublisherOptions::default(), Arc::new(ThreadSleeper))
    }

    pub fn with_options(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        options: PublisherOptions,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                options,
                transport,
                sleeper,
                state: Mutex::new(ConnectionState::default()),
                reconnect: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn reconnect_slot(&self) -> MutexGuard<'_, Option<ReconnectTask>> {
        match self.inner.reconnect.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Handle for a transport to report `handle_*` events through.
    pub fn handle(&self) -> PublisherHandle {
        PublisherHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn payload_config(&self) -> &PayloadConfig {
        &self.inner.options.payload
    }

    /// Open the connection.
    ///
    /// A failed first connect is reported to the caller and does not start
    /// the reconnection loop.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state();
            state.started = true;
            state.should_reconnect = true;
            state.phase = ConnectionPhase::Connecting;
        }

        let config = &self.inner.config;
        tracing::info!(
            broker = %config.broker_host(),
            port = config.port(),
            client_id = %config.client_id,
            certificates = config.connect_certs,
            "connecting to telemetry broker"
        );

        match self.inner.transport.connect(config) {
            Ok(()) => {
                self.handle_connected();
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "telemetry connect failed");
                self.state().phase = ConnectionPhase::Disconnected;
                Err(e.into())
            }
        }
    }

    /// Transport callback: connection established.
    ///
    /// Ignored once the publisher has been shut down.
    pub fn handle_connected(&self) {
        self.mark_connected();
    }

    /// Returns false, leaving the state untouched, when the publisher is
    /// not running.
    fn mark_connected(&self) -> bool {
        {
            let mut state = self.state();
            if !state.started || !state.should_reconnect {
                tracing::debug!("connection reported after shutdown, ignoring");
                return false;
            }
            state.phase = ConnectionPhase::Connected;
            state.reconnect_delay = INITIAL_RECONNECT_DELAY;
        }
        tracing::info!(broker = %self.inner.config.broker_host(), "telemetry broker connected");

        for topic in self.inner.config.subscribe_topics() {
            match self.inner.transport.subscribe(&topic) {
                Ok(()) => tracing::info!(topic = %topic, "subscribed"),
                Err(e) => tracing::warn!(topic = %topic, error = %e, "subscribe failed"),
            }
        }
        true
    }

    /// Transport callback: connection lost or closed with a reason code.
    pub fn handle_disconnected(&self, code: i32) {
        let reason = DisconnectReason::from_code(code);
        let should_reconnect = {
            let mut state = self.state();
            state.phase = ConnectionPhase::Disconnected;
            state.last_disconnect = Some(reason);
            state.should_reconnect && !reason.is_clean()
        };

        if reason.is_clean() {
            tracing::info!("telemetry broker disconnected cleanly");
            return;
        }

        tracing::warn!(code, reason = %reason, "unexpected telemetry disconnect");
        if should_reconnect {
            self.schedule_reconnect();
        }
    }

    /// Transport callback: inbound message on a subscribed topic.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) {
        match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(value) => tracing::info!(topic, message = %value, "inbound message"),
            Err(e) => tracing::warn!(topic, error = %e, bytes = payload.len(), "inbound message is not JSON"),
        }
    }

    /// Start the reconnection thread unless one is already running.
    fn schedule_reconnect(&self) {
        let mut slot = self.reconnect_slot();
        if let Some(task) = slot.as_ref() {
            if !task.handle.is_finished() {
                return;
            }
        }
        if let Some(task) = slot.take() {
            let _ = task.handle.join();
        }

        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let publisher = self.clone();

        let spawned = spawn_thread("telemetry-reconnect", move || {
            let _done = done_tx;
            publisher.reconnect_loop(&cancel_rx);
        });

        match spawned {
            Ok(handle) => {
                *slot = Some(ReconnectTask {
                    cancel: cancel_tx,
                    done: done_rx,
                    handle,
                });
            }
            Err(e) => tracing::error!(error = %e, "failed to spawn reconnect thread"),
        }
    }

    fn reconnect_loop(&self, cancel: &Receiver<()>) {
        loop {
            let delay = {
                let state = self.state();
                if !state.should_reconnect || state.is_connected() {
                    return;
                }
                state.reconnect_delay
            };

            tracing::info!(delay, "reconnecting after backoff");
            match cancel.recv_timeout(self.inner.options.time_unit * delay as u32) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("reconnection cancelled");
                    return;
                }
            }

            {
                let mut state = self.state();
                if !state.should_reconnect {
                    return;
                }
                state.phase = ConnectionPhase::Connecting;
            }

            match self.inner.transport.reconnect() {
                Ok(()) => {
                    if self.mark_connected() {
                        tracing::info!("telemetry reconnected");
                    } else {
                        tracing::info!("reconnect finished after shutdown, closing session");
                        if let Err(e) = self.inner.transport.disconnect() {
                            tracing::warn!(error = %e, "transport disconnect failed");
                        }
                    }
                    return;
                }
                Err(e) => {
                    let mut state = self.state();
                    state.phase = ConnectionPhase::Disconnected;
                    state.reconnect_delay = next_backoff(state.reconnect_delay);
                    tracing::warn!(error = %e, next_delay = state.reconnect_delay, "reconnect failed");
                }
            }
        }
    }

    /// Publish with retry.
    ///
    /// Makes one attempt plus `publish_retries` retries, sleeping
    /// `time_unit * 2^attempt` between them. Returns false straight away when
    /// the publisher is not running.
    pub fn publish(&self, topic: &str, payload: &str) -> bool {
        self.publish_with_retry(topic, payload).is_ok()
    }

    fn publish_with_retry(&self, topic: &str, payload: &str) -> Result<()> {
        {
            let state = self.state();
            if !state.started || !state.should_reconnect {
                return Err(Error::NotStarted);
            }
        }

        let attempts = self.inner.options.publish_retries + 1;
        for attempt in 0..attempts {
            let result = if self.state().is_connected() {
                self.inner.transport.publish(topic, payload)
            } else {
                Err(TransportError::NotConnected)
            };

            match result {
                Ok(()) => {
                    tracing::debug!(topic, attempt = attempt + 1, "published");
                    return Ok(());
                }
                Err(e) => tracing::warn!(topic, attempt = attempt + 1, error = %e, "publish attempt failed"),
            }

            if attempt + 1 < attempts {
                let wait = self.inner.options.time_unit * 2u32.saturating_pow(attempt);
                self.inner.sleeper.sleep(wait);
            }
        }

        tracing::error!(topic, attempts, "publish gave up");
        let should_reconnect = {
            let state = self.state();
            state.should_reconnect && state.phase == ConnectionPhase::Disconnected
        };
        if should_reconnect {
            self.schedule_reconnect();
        }

        Err(TransportError::RetriesExhausted {
            topic: topic.to_string(),
            attempts,
        }
        .into())
    }

    /// Validate and publish a combined payload on the telemetry topic.
    ///
    /// Validation failures are logged and never retried.
    pub fn publish_combined(&self, payload: &CombinedPayload) -> Result<()> {
        if let Err(e) = payload.validate(&self.inner.options.payload) {
            tracing::warn!(error = %e, timestamp = %payload.timestamp, "combined payload failed validation");
            return Err(e.into());
        }

        let topic = self.inner.config.telemetry_topic();
        let json = payload.to_json()?;
        self.publish_with_retry(&topic, &json)?;
        tracing::info!(topic = %topic, payload = %json, "combined payload sent");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state().clone()
    }

    pub fn status(&self) -> ConnectionStatusReport {
        let state = self.connection_state();
        let reconnecting = self
            .reconnect_slot()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false);
        let config = &self.inner.config;

        ConnectionStatusReport {
            connected: state.is_connected(),
            phase: state.phase,
            broker: config.broker_host(),
            port: config.port(),
            client_id: config.client_id.clone(),
            use_certificates: config.connect_certs,
            reconnect_delay: state.reconnect_delay,
            last_disconnect: state.last_disconnect.map(|r| r.to_string()),
            reconnecting,
        }
    }

    /// Stop reconnecting, join the reconnection thread with a bounded wait
    /// and close the transport. In-flight publishes are left to finish.
    pub fn shutdown(&self) {
        let was_started = {
            let mut state = self.state();
            let was_started = state.started;
            state.should_reconnect = false;
            state.started = false;
            was_started
        };

        let task = self.reconnect_slot().take();
        if let Some(task) = task {
            let _ = task.cancel.try_send(());
            let timeout = self.inner.options.time_unit * 2;
            match task.done.recv_timeout(timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = task.handle.join();
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!("reconnect thread did not stop in time, detaching");
                }
            }
        }

        if was_started {
            if let Err(e) = self.inner.transport.disconnect() {
                tracing::warn!(error = %e, "transport disconnect failed");
            }
            self.state().phase = ConnectionPhase::Disconnected;
            tracing::info!("telemetry publisher stopped");
        }
    }
}

impl std::fmt::Debug for TelemetryPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPublisher")
            .field("broker", &self.inner.config.broker_host())
            .field("state", &self.connection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::LogTransport;

    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&self, _duration: Duration) {}
    }

    fn publisher() -> TelemetryPublisher {
        TelemetryPublisher::with_options(
            ConnectionConfig::default(),
            Arc::new(LogTransport::new()),
            PublisherOptions {
                time_unit: Duration::from_millis(1),
                ..Default::default()
            },
            Arc::new(NoSleep),
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delay = INITIAL_RECONNECT_DELAY;
        let mut seen = vec![delay];
        for _ in 0..7 {
            delay = next_backoff(delay);
            seen.push(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_publish_before_start_fails_fast() {
        let publisher = publisher();
        assert!(!publisher.publish("t", "{}"));
        assert!(!publisher.is_connected());
    }

    #[test]
    fn test_start_publish_shutdown() {
        let publisher = publisher();
        publisher.start().unwrap();
        assert!(publisher.is_connected());
        assert!(publisher.publish("t", "{}"));

        publisher.shutdown();
        assert!(!publisher.is_connected());
        assert!(!publisher.publish("t", "{}"));
    }

    #[test]
    fn test_clean_disconnect_does_not_reconnect() {
        let publisher = publisher();
        publisher.start().unwrap();
        publisher.handle_disconnected(0);

        let status = publisher.status();
        assert!(!status.connected);
        assert!(!status.reconnecting);
        assert_eq!(status.last_disconnect.as_deref(), Some("clean disconnect"));
    }

    #[test]
    fn test_status_report() {
        let publisher = publisher();
        let status = publisher.status();
        assert_eq!(status.broker, "localhost");
        assert_eq!(status.port, 1883);
        assert_eq!(status.phase, ConnectionPhase::Disconnected);
        assert_eq!(status.reconnect_delay, 1);
    }

    #[test]
    fn test_connected_callback_ignored_when_stopped() {
        let publisher = publisher();
        publisher.handle_connected();
        assert!(!publisher.is_connected());

        publisher.start().unwrap();
        publisher.shutdown();
        publisher.handle_connected();
        assert!(!publisher.is_connected());
        assert_eq!(publisher.connection_state().phase, ConnectionPhase::Disconnected);
    }

    #[test]
    fn test_handle_does_not_keep_publisher_alive() {
        let publisher = publisher();
        let handle = publisher.handle();
        assert!(handle.upgrade().is_some());

        drop(publisher);
        assert!(handle.upgrade().is_none());
    }

    #[test]
    fn test_handle_message_accepts_garbage() {
        let publisher = publisher();
        publisher.handle_message("cmd", br#"{"reset": true}"#);
        publisher.handle_message("cmd", b"\xff\x00");
    }
}
