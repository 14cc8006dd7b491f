//! Utility functions shared by the measurement and telemetry layers.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Source of monotonic and wall-clock time.
///
/// Lets the movement gate and telemetry code run against a manual clock in
/// tests instead of the wall clock. Both readings advance together.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// UTC time used to stamp distance samples.
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    origin_utc: DateTime<Utc>,
    offset_nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_utc: Utc::now(),
            offset_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.elapsed())
            .ok()
            .and_then(|elapsed| self.origin_utc.checked_add_signed(elapsed))
            .unwrap_or(self.origin_utc)
    }
}

/// Spawn a named thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

/// Euclidean distance between two image-space points.
pub fn euclidean_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

/// Normalized weights `exp(linspace(start, 0, n))`.
///
/// The last entry (the most recent sample) gets the largest weight.
pub fn recency_weights(n: usize, start: f64) -> Vec<f64> {
    let raw: Vec<f64> = match n {
        0 => return Vec::new(),
        1 => vec![1.0],
        _ => (0..n)
            .map(|i| (start - start * i as f64 / (n - 1) as f64).exp())
            .collect(),
    };
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

/// Weighted mean of `values` using [`recency_weights`].
pub fn recency_weighted_mean(values: impl ExactSizeIterator<Item = f64>, start: f64) -> Option<f64> {
    let weights = recency_weights(values.len(), start);
    if weights.is_empty() {
        return None;
    }
    Some(values.zip(weights).map(|(v, w)| v * w).sum())
}

/// Population variance of a sequence.
pub fn variance(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count();
    if n == 0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
}
