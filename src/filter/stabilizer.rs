//! Per-keypoint stabilization.
//!
//! One filter per keypoint identity (`"<class>_<index>"` by convention),
//! created lazily on first sight. Each observation runs predict then
//! correct, and the predicted position is what callers get back.

use std::collections::HashMap;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use super::constant_velocity::ConstantVelocityFilterFactory;
use super::pass_through::PassThroughFilterFactory;
use super::traits::{Filter, FilterFactory};
use crate::detection::Keypoint;

/// Which filter backs each keypoint identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilizerKind {
    #[default]
    ConstantVelocity,
    PassThrough,
}

/// Stabilizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    pub kind: StabilizerKind,
    pub process_noise: f64,
    pub measurement_noise: f64,
    pub initial_covariance: f64,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            kind: StabilizerKind::ConstantVelocity,
            process_noise: 1e-3,
            measurement_noise: 1e-1,
            initial_covariance: 1e-1,
        }
    }
}

impl StabilizerConfig {
    pub fn build_factory(&self) -> Box<dyn FilterFactory> {
        match self.kind {
            StabilizerKind::ConstantVelocity => Box::new(ConstantVelocityFilterFactory::new(
                self.process_noise,
                self.measurement_noise,
                self.initial_covariance,
            )),
            StabilizerKind::PassThrough => Box::new(PassThroughFilterFactory::new()),
        }
    }
}

/// Keyed store of per-identity filters.
pub struct KeypointStabilizer {
    factory: Box<dyn FilterFactory>,
    filters: HashMap<String, Box<dyn Filter>>,
}

impl KeypointStabilizer {
    pub fn new(factory: Box<dyn FilterFactory>) -> Self {
        Self {
            factory,
            filters: HashMap::new(),
        }
    }

    pub fn from_config(config: &StabilizerConfig) -> Self {
        Self::new(config.build_factory())
    }

    /// Stabilize one observation of keypoint `id`.
    ///
    /// Returns the predicted position for this frame, computed before the
    /// observation is folded in.
    pub fn stabilize(&mut self, id: &str, keypoint: &Keypoint) -> (f64, f64) {
        self.stabilize_point(id, keypoint.position())
    }

    /// Same as [`stabilize`](Self::stabilize) for a bare position.
    pub fn stabilize_point(&mut self, id: &str, (x, y): (f64, f64)) -> (f64, f64) {
        let measurement = DVector::from_vec(vec![x, y]);

        let factory = &self.factory;
        let filter = self.filters.entry(id.to_string()).or_insert_with(|| {
            tracing::debug!(keypoint = id, x, y, "tracking new keypoint");
            factory.create_filter(&measurement)
        });

        let predicted = filter.predict();
        filter.update(&measurement);
        (predicted[0], predicted[1])
    }

    /// Drop the filter for one identity.
    pub fn forget(&mut self, id: &str) -> bool {
        self.filters.remove(id).is_some()
    }

    /// Drop every filter.
    pub fn reset(&mut self) {
        self.filters.clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.filters.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl Default for KeypointStabilizer {
    fn default() -> Self {
        Self::from_config(&StabilizerConfig::default())
    }
}

impl std::fmt::Debug for KeypointStabilizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeypointStabilizer")
            .field("identities", &self.filters.len())
            .finish()
    }
}
