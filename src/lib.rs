//! # Keypoint Gauge - Keypoint Distance Measurement
//!
//! Turns noisy per-frame keypoint detections into stable physical-unit
//! distances and publishes them when they reflect real movement.
//!
//! ## Features
//!
//! - Per-keypoint constant-velocity Kalman stabilization
//! - Rigid reference frame validation and least-squares rectification
//! - Automatic pixel-to-unit calibration
//! - Multi-criterion movement gate with hot-reloadable thresholds
//! - Telemetry publishing with retry, reconnection and payload validation
//!
//! ## Example
//!
//! ```rust,ignore
//! use keypoint_gauge::{DistanceEngine, EngineConfig, DetectionRecord};
//!
//! let mut engine = DistanceEngine::new(EngineConfig::frame_to_target());
//! let detections: Vec<DetectionRecord> = read_frame();
//! if let Some(distance) = engine.compute(&detections) {
//!     println!("{distance:.2}");
//! }
//! ```

// Internal modules (ports of filterpy/OpenCV Kalman and scipy least squares)
pub(crate) mod internal;

// Public modules
pub mod calibration;
pub mod detection;
pub mod filter;
pub mod geometry;
pub mod measurement;
pub mod movement;
pub mod pipeline;
pub mod telemetry;
pub mod utils;

// Re-exports for convenience
pub use calibration::{AutoCalibrator, CalibrationState};
pub use detection::{DetectionRecord, Keypoint, KeypointSet};
pub use filter::{Filter, FilterFactory, KeypointStabilizer};
pub use geometry::GeometryRectifier;
pub use measurement::{DistanceEngine, DistanceSample, DistanceSink, EngineConfig, MeasurementKind};
pub use movement::{MovementConfig, MovementGate};
pub use pipeline::{MeasurementPipeline, PipelineConfig};
pub use telemetry::{
    CombinedPayload, ConnectionConfig, PayloadAssembler, PayloadConfig, TelemetryPublisher, Transport,
    TransportError, ValidationError,
};

// Error types
pub use crate::error::{Error, Result};

mod error {
    use thiserror::Error;

    use crate::telemetry::{TransportError, ValidationError};

    /// Errors that can occur in the keypoint gauge library
    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid configuration: {0}")]
        InvalidConfig(String),

        #[error("Invalid keypoints: {0}")]
        InvalidKeypoints(String),

        #[error("Payload validation failed: {0}")]
        Validation(#[from] ValidationError),

        #[error("Transport error: {0}")]
        Transport(#[from] TransportError),

        #[error("Publisher has not been started")]
        NotStarted,

        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),

        #[error("JSON error: {0}")]
        Json(#[from] serde_json::Error),
    }

    /// Result type for keypoint gauge operations
    pub type Result<T> = std::result::Result<T, Error>;
}
