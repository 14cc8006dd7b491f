//! Background thread that publishes assembled payloads so the frame path
//! never waits on publish backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{select, Receiver, Sender};
use serde::Serialize;

use super::payload::CombinedPayload;
use super::publisher::TelemetryPublisher;
use crate::utils::spawn_thread;
use crate::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub published: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            received: self.received.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct TelemetryWorker {
    handle: JoinHandle<()>,
    stop: Sender<()>,
    counters: Arc<Counters>,
}

impl TelemetryWorker {
    pub fn spawn(publisher: TelemetryPublisher, payloads: Receiver<CombinedPayload>) -> Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let counters = Arc::new(Counters::default());
        let thread_counters = Arc::clone(&counters);

        let handle = spawn_thread("telemetry-worker", move || loop {
            select! {
                recv(payloads) -> msg => match msg {
                    Ok(payload) => {
                        thread_counters.received.fetch_add(1, Ordering::Relaxed);
                        match publisher.publish_combined(&payload) {
                            Ok(()) => thread_counters.published.fetch_add(1, Ordering::Relaxed),
                            Err(_) => thread_counters.failed.fetch_add(1, Ordering::Relaxed),
                        };
                    }
                    Err(_) => {
                        tracing::debug!("payload channel closed, telemetry worker exiting");
                        break;
                    }
                },
                recv(stop_rx) -> _ => {
                    tracing::debug!("telemetry worker stopped");
                    break;
                }
            }
        })?;

        Ok(Self {
            handle,
            stop: stop_tx,
            counters,
        })
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Wait until every sender is dropped and the queue is drained.
    pub fn finish(self) -> WorkerStats {
        if self.handle.join().is_err() {
            tracing::error!("telemetry worker panicked");
        }
        self.counters.snapshot()
    }

    /// Stop without draining queued payloads.
    pub fn stop(self) -> WorkerStats {
        let _ = self.stop.try_send(());
        self.finish()
    }
}

impl std::fmt::Debug for TelemetryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryWorker").field("stats", &self.stats()).finish()
    }
}
