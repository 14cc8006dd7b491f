//! Movement gate configuration.
//!
//! Loaded from JSON with three sections (`movement_detection`, `filtering`,
//! `debug`). Every field has a default so partial files are accepted.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Thresholds driving the gate's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionThresholds {
    /// Minimum change from the last sent distance, in physical units.
    #[serde(alias = "distance_threshold_cm")]
    pub distance_threshold: f64,
    /// Minimum rate of change of the distance, in units per second.
    #[serde(alias = "velocity_threshold_cm_s")]
    pub velocity_threshold: f64,
    /// Number of recent frames inspected by the stability filter.
    pub position_stability_frames: usize,
    /// Observations older than this are ignored by the velocity filters.
    pub temporal_window_seconds: f64,
    /// Positions whose standard deviation stays under this are stationary.
    pub position_noise_threshold_px: f64,
    pub min_time_between_sends_ms: u64,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            distance_threshold: 0.5,
            velocity_threshold: 0.2,
            position_stability_frames: 5,
            temporal_window_seconds: 2.0,
            position_noise_threshold_px: 2.0,
            min_time_between_sends_ms: 500,
        }
    }
}

/// Per-filter switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterToggles {
    /// Master switch; when off every sample is sent.
    pub enable_movement_detection: bool,
    pub enable_velocity_filter: bool,
    pub enable_stability_filter: bool,
    pub enable_relative_movement_filter: bool,
    pub enable_temporal_filter: bool,
}

impl Default for FilterToggles {
    fn default() -> Self {
        Self {
            enable_movement_detection: true,
            enable_velocity_filter: true,
            enable_stability_filter: true,
            enable_relative_movement_filter: true,
            enable_temporal_filter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugOptions {
    pub log_movement_metrics: bool,
    pub log_filtered_attempts: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            log_movement_metrics: true,
            log_filtered_attempts: false,
        }
    }
}

/// Complete movement gate configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    pub movement_detection: DetectionThresholds,
    #[serde(alias = "mqtt_filtering")]
    pub filtering: FilterToggles,
    pub debug: DebugOptions,
}

/// Toggleable filters, addressable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    MovementDetection,
    Velocity,
    Stability,
    RelativeMovement,
    Temporal,
}

impl FilterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::MovementDetection => "movement_detection",
            FilterKind::Velocity => "velocity",
            FilterKind::Stability => "stability",
            FilterKind::RelativeMovement => "relative_movement",
            FilterKind::Temporal => "temporal",
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "movement_detection" => Ok(FilterKind::MovementDetection),
            "velocity" => Ok(FilterKind::Velocity),
            "stability" => Ok(FilterKind::Stability),
            "relative_movement" => Ok(FilterKind::RelativeMovement),
            "temporal" => Ok(FilterKind::Temporal),
            other => Err(Error::InvalidConfig(format!("unknown filter: {}", other))),
        }
    }
}

/// Partial update; `None` leaves the current value alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfigPatch {
    pub distance_threshold: Option<f64>,
    pub velocity_threshold: Option<f64>,
    pub position_stability_frames: Option<usize>,
    pub temporal_window_seconds: Option<f64>,
    pub position_noise_threshold_px: Option<f64>,
    pub min_time_between_sends_ms: Option<u64>,
    pub enable_movement_detection: Option<bool>,
    pub enable_velocity_filter: Option<bool>,
    pub enable_stability_filter: Option<bool>,
    pub enable_relative_movement_filter: Option<bool>,
    pub enable_temporal_filter: Option<bool>,
}

impl MovementConfig {
    /// Defaults for the marker spring measurement: finer distance step,
    /// no velocity or relative movement filtering.
    pub fn marker() -> Self {
        let mut config = Self::default();
        config.movement_detection.distance_threshold = 0.2;
        config.movement_detection.velocity_threshold = 10.0;
        config.movement_detection.position_stability_frames = 1;
        config.movement_detection.temporal_window_seconds = 0.5;
        config.filtering.enable_velocity_filter = false;
        config.filtering.enable_relative_movement_filter = false;
        config
    }

    /// Read a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        tracing::info!(path = %path.as_ref().display(), "loaded movement config");
        Ok(config)
    }

    /// Read a configuration file, falling back to defaults on any error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %path.as_ref().display(), error = %e, "movement config unusable, using defaults");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.movement_detection;
        let non_negative = [
            ("distance_threshold", t.distance_threshold),
            ("velocity_threshold", t.velocity_threshold),
            ("temporal_window_seconds", t.temporal_window_seconds),
            ("position_noise_threshold_px", t.position_noise_threshold_px),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::InvalidConfig(format!("{} must be a non-negative number, got {}", name, value)));
            }
        }
        if t.position_stability_frames == 0 {
            return Err(Error::InvalidConfig("position_stability_frames must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Capacity of the gate's position and distance histories.
    pub fn history_capacity(&self) -> usize {
        (2 * self.movement_detection.position_stability_frames).max(20)
    }

    pub fn is_enabled(&self, filter: FilterKind) -> bool {
        let f = &self.filtering;
        match filter {
            FilterKind::MovementDetection => f.enable_movement_detection,
            FilterKind::Velocity => f.enable_velocity_filter,
            FilterKind::Stability => f.enable_stability_filter,
            FilterKind::RelativeMovement => f.enable_relative_movement_filter,
            FilterKind::Temporal => f.enable_temporal_filter,
        }
    }

    pub fn enable_filter(&mut self, filter: FilterKind, enabled: bool) {
        let f = &mut self.filtering;
        let slot = match filter {
            FilterKind::MovementDetection => &mut f.enable_movement_detection,
            FilterKind::Velocity => &mut f.enable_velocity_filter,
            FilterKind::Stability => &mut f.enable_stability_filter,
            FilterKind::RelativeMovement => &mut f.enable_relative_movement_filter,
            FilterKind::Temporal => &mut f.enable_temporal_filter,
        };
        *slot = enabled;
    }

    /// Apply a partial update and validate the result.
    ///
    /// On error the configuration is left untouched.
    pub fn apply(&mut self, patch: &MovementConfigPatch) -> Result<()> {
        let mut next = self.clone();
        let t = &mut next.movement_detection;
        if let Some(v) = patch.distance_threshold {
            t.distance_threshold = v;
        }
        if let Some(v) = patch.velocity_threshold {
            t.velocity_threshold = v;
        }
        if let Some(v) = patch.position_stability_frames {
            t.position_stability_frames = v;
        }
        if let Some(v) = patch.temporal_window_seconds {
            t.temporal_window_seconds = v;
        }
        if let Some(v) = patch.position_noise_threshold_px {
            t.position_noise_threshold_px = v;
        }
        if let Some(v) = patch.min_time_between_sends_ms {
            t.min_time_between_sends_ms = v;
        }

        let toggles = [
            (FilterKind::MovementDetection, patch.enable_movement_detection),
            (FilterKind::Velocity, patch.enable_velocity_filter),
            (FilterKind::Stability, patch.enable_stability_filter),
            (FilterKind::RelativeMovement, patch.enable_relative_movement_filter),
            (FilterKind::Temporal, patch.enable_temporal_filter),
        ];
        for (filter, enabled) in toggles {
            if let Some(enabled) = enabled {
                next.enable_filter(filter, enabled);
            }
        }

        next.validate()?;
        *self = next;
        Ok(())
    }
}
