//! Accepted distance samples and the capability to receive them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A distance accepted by the movement gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistanceSample {
    /// Distance in physical units.
    pub distance: f64,
    pub timestamp: DateTime<Utc>,
    /// Payload field the sample feeds, e.g. `buttonX`.
    pub source_tag: String,
}

impl DistanceSample {
    /// Sample stamped with the current wall-clock time.
    pub fn new(distance: f64, source_tag: impl Into<String>) -> Self {
        Self::at(distance, Utc::now(), source_tag)
    }

    pub fn at(distance: f64, timestamp: DateTime<Utc>, source_tag: impl Into<String>) -> Self {
        Self {
            distance,
            timestamp,
            source_tag: source_tag.into(),
        }
    }
}

/// Something that accepts distance samples.
///
/// Engines hold this instead of a concrete publisher so tests can observe
/// what would have been sent.
pub trait DistanceSink: Send + Sync {
    fn accept(&self, sample: DistanceSample);
}

impl<S: DistanceSink + ?Sized> DistanceSink for Arc<S> {
    fn accept(&self, sample: DistanceSample) {
        (**self).accept(sample)
    }
}

impl DistanceSink for crossbeam_channel::Sender<DistanceSample> {
    fn accept(&self, sample: DistanceSample) {
        if self.send(sample).is_err() {
            tracing::warn!("distance sample dropped, receiver is gone");
        }
    }
}
