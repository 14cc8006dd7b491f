//! Recursive filters for keypoint stabilization.
//!
//! This module provides:
//! - `ConstantVelocityFilter` - Kalman filter over `[x, y, vx, vy]`
//! - `PassThroughFilter` - Baseline without smoothing
//! - `KeypointStabilizer` - One filter per keypoint identity

mod constant_velocity;
mod pass_through;
mod stabilizer;
mod traits;

pub use constant_velocity::{ConstantVelocityFilter, ConstantVelocityFilterFactory};
pub use pass_through::{PassThroughFilter, PassThroughFilterFactory};
pub use stabilizer::{KeypointStabilizer, StabilizerConfig, StabilizerKind};
pub use traits::{Filter, FilterFactory};
