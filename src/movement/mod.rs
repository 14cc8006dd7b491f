//! Movement gating of distance samples.
//!
//! This module provides:
//! - `MovementGate` - Ordered filter pipeline deciding what gets sent
//! - `MovementConfig` - JSON configuration with hot reload
//! - `RingBuffer` - Fixed-capacity history storage

mod config;
mod gate;
mod history;
mod stats;

pub use config::{DebugOptions, DetectionThresholds, FilterKind, FilterToggles, MovementConfig, MovementConfigPatch};
pub use gate::{MovementGate, DEFAULT_PIXELS_PER_UNIT};
pub use history::RingBuffer;
pub use stats::{FilterBreakdown, FilterCount, GateStatistics, MovementMetrics, Rejection};
