//! Distance measurement.
//!
//! A [`DistanceEngine`] locates two points per frame, converts their
//! separation to physical units and passes accepted samples to a
//! [`DistanceSink`].

mod config;
mod engine;
mod points;
mod sample;

pub use config::{ClassLabels, EngineConfig, MeasurementKind};
pub use engine::{clamp_distance, DistanceEngine, EngineDiagnostics};
pub use sample::{DistanceSample, DistanceSink};
