//! MQTT transport backed by `rumqttc`.
//!
//! The rumqttc event loop runs on its own thread. It answers connect and
//! reconnect requests through an acknowledgement channel and reports lost
//! connections and inbound messages to the publisher. After a connection
//! error the loop parks until the publisher's reconnection thread asks for
//! another attempt, so backoff stays with the publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
};

use super::config::ConnectionConfig;
use super::publisher::PublisherHandle;
use super::transport::{DisconnectReason, Transport, TransportError};
use crate::utils::spawn_thread;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_CAPACITY: usize = 10;

/// Reason code for a CONNACK return code.
pub fn return_code(code: ConnectReturnCode) -> i32 {
    #[allow(unreachable_patterns)]
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
        _ => DisconnectReason::NetworkError.code(),
    }
}

/// Reason code for an event loop failure.
pub fn error_code(error: &ConnectionError) -> i32 {
    match error {
        ConnectionError::ConnectionRefused(code) => return_code(*code),
        ConnectionError::NetworkTimeout => DisconnectReason::Timeout.code(),
        _ => DisconnectReason::NetworkError.code(),
    }
}

/// Client options for `config`: persistent session, keepalive, and either
/// mutual TLS or username/password.
pub fn mqtt_options(config: &ConnectionConfig) -> Result<MqttOptions, TransportError> {
    let broker = config.broker_host();
    let mut options = MqttOptions::new(config.client_id.clone(), broker.clone(), config.port());
    options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
    options.set_clean_session(false);

    if config.connect_certs {
        let read = |name: &str, path: &Option<std::path::PathBuf>| -> Result<Vec<u8>, TransportError> {
            let path = path.as_ref().ok_or_else(|| TransportError::ConnectFailed {
                broker: broker.clone(),
                reason: format!("{} is not set", name),
            })?;
            std::fs::read(path).map_err(|e| TransportError::ConnectFailed {
                broker: broker.clone(),
                reason: format!("reading {} {}: {}", name, path.display(), e),
            })
        };
        let ca = read("ca_certs", &config.ca_certs)?;
        let cert = read("certfile", &config.certfile)?;
        let key = read("keyfile", &config.keyfile)?;
        options.set_transport(rumqttc::Transport::tls(ca, Some((cert, key)), None));
    } else if !config.username.is_empty() {
        options.set_credentials(config.username.clone(), config.password.clone());
    }

    Ok(options)
}

type Ack = Result<(), i32>;

struct Session {
    client: Client,
    broker: String,
    acks: Receiver<Ack>,
    resume: Sender<()>,
    stopping: Arc<AtomicBool>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

/// [`Transport`] speaking MQTT 3.1.1 to a real broker.
///
/// Call [`MqttTransport::bind`] with the publisher's handle before
/// `start` so lost connections and inbound messages reach the publisher.
pub struct MqttTransport {
    publisher: Mutex<Option<PublisherHandle>>,
    session: Mutex<Option<Session>>,
    ack_timeout: Duration,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::with_ack_timeout(DEFAULT_ACK_TIMEOUT)
    }

    /// `ack_timeout` bounds how long connect and reconnect wait for CONNACK.
    pub fn with_ack_timeout(ack_timeout: Duration) -> Self {
        Self {
            publisher: Mutex::new(None),
            session: Mutex::new(None),
            ack_timeout,
        }
    }

    pub fn bind(&self, publisher: PublisherHandle) {
        match self.publisher.lock() {
            Ok(mut guard) => *guard = Some(publisher),
            Err(poisoned) => *poisoned.into_inner() = Some(publisher),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publisher(&self) -> Option<PublisherHandle> {
        match self.publisher.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn client(&self) -> Result<Client, TransportError> {
        self.session()
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn await_ack(&self, acks: &Receiver<Ack>, broker: &str) -> Result<(), TransportError> {
        match acks.recv_timeout(self.ack_timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(code)) => {
                let reason = DisconnectReason::from_code(code);
                if (1..=5).contains(&code) {
                    Err(TransportError::Refused(reason))
                } else {
                    Err(TransportError::ConnectFailed {
                        broker: broker.to_string(),
                        reason: reason.to_string(),
                    })
                }
            }
            Err(RecvTimeoutError::Timeout) => Err(TransportError::ConnectFailed {
                broker: broker.to_string(),
                reason: format!("no CONNACK within {:?}", self.ack_timeout),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::NotConnected),
        }
    }

    fn close(&self, session: Session) {
        session.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = session.client.try_disconnect() {
            tracing::debug!(error = %e, "mqtt disconnect request not queued");
        }

        let Session {
            resume, done, handle, ..
        } = session;
        drop(resume);
        match done.recv_timeout(self.ack_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
            }
            Err(RecvTimeoutError::Timeout) => tracing::warn!("mqtt event loop did not stop in time, detaching"),
        }
    }
}

impl Transport for MqttTransport {
    fn connect(&self, config: &ConnectionConfig) -> Result<(), TransportError> {
        let options = mqtt_options(config)?;
        let broker = config.broker_host();

        if let Some(previous) = self.session().take() {
            self.close(previous);
        }

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let (ack_tx, acks) = crossbeam_channel::unbounded();
        let (resume, resume_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done) = crossbeam_channel::bounded::<()>(1);
        let stopping = Arc::new(AtomicBool::new(false));

        let link = LoopLink {
            acks: ack_tx,
            resume: resume_rx,
            stopping: Arc::clone(&stopping),
            publisher: self.publisher(),
        };
        let handle = spawn_thread("mqtt-event-loop", move || {
            let _done = done_tx;
            run_event_loop(connection, link);
        })
        .map_err(|e| TransportError::ConnectFailed {
            broker: broker.clone(),
            reason: format!("spawning event loop: {}", e),
        })?;

        let session = Session {
            client,
            broker: broker.clone(),
            acks,
            resume,
            stopping,
            done,
            handle,
        };

        match self.await_ack(&session.acks, &broker) {
            Ok(()) => {
                tracing::info!(broker = %broker, port = config.port(), "mqtt session established");
                *self.session() = Some(session);
                Ok(())
            }
            Err(e) => {
                self.close(session);
                Err(e)
            }
        }
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        let (acks, resume, broker) = {
            let guard = self.session();
            let session = guard.as_ref().ok_or(TransportError::NotConnected)?;
            (session.acks.clone(), session.resume.clone(), session.broker.clone())
        };

        while acks.try_recv().is_ok() {}
        if resume.try_send(()).is_err() {
            tracing::debug!("mqtt reconnect already requested");
        }
        self.await_ack(&acks, &broker)
    }

    fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        self.client()?
            .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(session) = self.session().take() {
            tracing::info!(broker = %session.broker, "closing mqtt session");
            self.close(session);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("ack_timeout", &self.ack_timeout)
            .field("session", &self.session().as_ref().map(|s| s.broker.clone()))
            .finish()
    }
}

struct LoopLink {
    acks: Sender<Ack>,
    resume: Receiver<()>,
    stopping: Arc<AtomicBool>,
    publisher: Option<PublisherHandle>,
}

impl LoopLink {
    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

fn run_event_loop(mut connection: Connection, link: LoopLink) {
    let mut connected = false;

    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                connected = true;
                tracing::debug!(session_present = ack.session_present, "mqtt CONNACK");
                let _ = link.acks.send(Ok(()));
            }
            Ok(Event::Incoming(Packet::Publish(message))) => {
                if let Some(publisher) = link.publisher.as_ref().and_then(PublisherHandle::upgrade) {
                    publisher.handle_message(&message.topic, &message.payload);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("mqtt disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if link.stopping() {
                    break;
                }

                let code = error_code(&e);
                if connected {
                    connected = false;
                    tracing::warn!(error = %e, code, "mqtt connection lost");
                    if let Some(publisher) = link.publisher.as_ref().and_then(PublisherHandle::upgrade) {
                        publisher.handle_disconnected(code);
                    }
                } else {
                    tracing::warn!(error = %e, code, "mqtt connect failed");
                    let _ = link.acks.send(Err(code));
                }

                // Parked until the publisher asks for another attempt.
                if link.resume.recv().is_err() || link.stopping() {
                    break;
                }
            }
        }
    }

    tracing::debug!("mqtt event loop stopped");
}
