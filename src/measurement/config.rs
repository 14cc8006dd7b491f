//! Distance engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationConfig;
use crate::filter::StabilizerConfig;
use crate::movement::MovementConfig;
use crate::{Error, Result};

/// Which pair of points an engine measures between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    /// Moving part centroid to corner D of the reference frame.
    FrameToTarget,
    /// Marker bounding box top to the marker keypoint center.
    MarkerSpring,
}

/// Class names emitted by the vision model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassLabels {
    pub reference_frame: String,
    pub moving_part: String,
    pub marker: String,
}

impl Default for ClassLabels {
    fn default() -> Self {
        Self {
            reference_frame: "reference-frame".to_string(),
            moving_part: "moving-part".to_string(),
            marker: "marker".to_string(),
        }
    }
}

/// Settings for one [`DistanceEngine`](super::DistanceEngine).
///
/// Deserialization starts from the preset for `kind` (frame-to-target when
/// absent) and overrides only the keys present. A nested section that is
/// present replaces the preset's section as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "EngineConfigFile")]
pub struct EngineConfig {
    pub kind: MeasurementKind,
    /// Payload field this engine reports.
    pub field: String,
    pub labels: ClassLabels,
    /// Physical length of reference edge D-C.
    pub frame_width: f64,
    /// Physical length of reference edge C-B.
    pub frame_height: f64,
    /// Allowed relative error of the reference edge ratio.
    pub geometry_error_threshold: f64,
    pub calibration: CalibrationConfig,
    pub max_distance: f64,
    /// Results up to `max_distance * soft_clamp_ratio` are clamped to
    /// `max_distance`; anything beyond is discarded.
    pub soft_clamp_ratio: f64,
    /// Added to every converted distance before clamping.
    pub offset: f64,
    /// Number of centroids averaged for the moving part.
    pub smoothing_window: usize,
    pub stabilizer: StabilizerConfig,
    pub movement: MovementConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::frame_to_target()
    }
}

/// On-disk form of [`EngineConfig`]; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EngineConfigFile {
    kind: Option<MeasurementKind>,
    field: Option<String>,
    labels: Option<ClassLabels>,
    frame_width: Option<f64>,
    frame_height: Option<f64>,
    geometry_error_threshold: Option<f64>,
    calibration: Option<CalibrationConfig>,
    max_distance: Option<f64>,
    soft_clamp_ratio: Option<f64>,
    offset: Option<f64>,
    smoothing_window: Option<usize>,
    stabilizer: Option<StabilizerConfig>,
    movement: Option<MovementConfig>,
}

impl From<EngineConfigFile> for EngineConfig {
    fn from(file: EngineConfigFile) -> Self {
        let preset = Self::preset(file.kind.unwrap_or(MeasurementKind::FrameToTarget));
        Self {
            kind: preset.kind,
            field: file.field.unwrap_or(preset.field),
            labels: file.labels.unwrap_or(preset.labels),
            frame_width: file.frame_width.unwrap_or(preset.frame_width),
            frame_height: file.frame_height.unwrap_or(preset.frame_height),
            geometry_error_threshold: file.geometry_error_threshold.unwrap_or(preset.geometry_error_threshold),
            calibration: file.calibration.unwrap_or(preset.calibration),
            max_distance: file.max_distance.unwrap_or(preset.max_distance),
            soft_clamp_ratio: file.soft_clamp_ratio.unwrap_or(preset.soft_clamp_ratio),
            offset: file.offset.unwrap_or(preset.offset),
            smoothing_window: file.smoothing_window.unwrap_or(preset.smoothing_window),
            stabilizer: file.stabilizer.unwrap_or(preset.stabilizer),
            movement: file.movement.unwrap_or(preset.movement),
        }
    }
}

impl EngineConfig {
    pub fn frame_to_target() -> Self {
        Self {
            kind: MeasurementKind::FrameToTarget,
            field: "buttonX".to_string(),
            labels: ClassLabels::default(),
            frame_width: 30.0,
            frame_height: 21.0,
            geometry_error_threshold: 0.15,
            calibration: CalibrationConfig::default(),
            max_distance: 30.0,
            soft_clamp_ratio: 1.1,
            offset: 0.0,
            smoothing_window: 5,
            stabilizer: StabilizerConfig::default(),
            movement: MovementConfig::default(),
        }
    }

    pub fn marker_spring() -> Self {
        Self {
            kind: MeasurementKind::MarkerSpring,
            field: "markerZ".to_string(),
            max_distance: 100.0,
            movement: MovementConfig::marker(),
            ..Self::frame_to_target()
        }
    }

    pub fn preset(kind: MeasurementKind) -> Self {
        match kind {
            MeasurementKind::FrameToTarget => Self::frame_to_target(),
            MeasurementKind::MarkerSpring => Self::marker_spring(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("frame_width", self.frame_width),
            ("frame_height", self.frame_height),
            ("max_distance", self.max_distance),
            ("calibration.reference_length", self.calibration.reference_length),
            ("calibration.initial_pixels_per_unit", self.calibration.initial_pixels_per_unit),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::InvalidConfig(format!("{} must be positive, got {}", name, value)));
            }
        }
        if !(self.soft_clamp_ratio.is_finite() && self.soft_clamp_ratio >= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "soft_clamp_ratio must be at least 1, got {}",
                self.soft_clamp_ratio
            )));
        }
        if !self.offset.is_finite() {
            return Err(Error::InvalidConfig("offset must be finite".to_string()));
        }
        if self.field.is_empty() {
            return Err(Error::InvalidConfig("field must not be empty".to_string()));
        }
        if self.smoothing_window == 0 || self.calibration.history_len == 0 {
            return Err(Error::InvalidConfig("window lengths must be at least 1".to_string()));
        }
        self.movement.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::FilterKind;

    #[test]
    fn test_presets() {
        let button = EngineConfig::frame_to_target();
        assert_eq!(button.field, "buttonX");
        assert_eq!(button.max_distance, 30.0);
        assert!(button.validate().is_ok());

        let marker = EngineConfig::marker_spring();
        assert_eq!(marker.kind, MeasurementKind::MarkerSpring);
        assert_eq!(marker.field, "markerZ");
        assert_eq!(marker.max_distance, 100.0);
        assert!(!marker.movement.is_enabled(FilterKind::Velocity));
        assert!(marker.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{"kind": "marker_spring", "field": "markerZ", "offset": -0.9, "labels": {"marker": "marcador"}}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.kind, MeasurementKind::MarkerSpring);
        assert_eq!(config.offset, -0.9);
        assert_eq!(config.labels.marker, "marcador");
        assert_eq!(config.labels.reference_frame, "reference-frame");
    }

    #[test]
    fn test_missing_keys_follow_kind_preset() {
        let marker: EngineConfig = serde_json::from_str(r#"{"kind": "marker_spring"}"#).unwrap();
        assert_eq!(marker, EngineConfig::marker_spring());
        assert_eq!(marker.field, "markerZ");
        assert_eq!(marker.max_distance, 100.0);
        assert!(!marker.movement.is_enabled(FilterKind::Velocity));

        let button: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(button, EngineConfig::frame_to_target());

        let tuned: EngineConfig = serde_json::from_str(r#"{"kind": "marker_spring", "max_distance": 80.0}"#).unwrap();
        assert_eq!(tuned.max_distance, 80.0);
        assert_eq!(tuned.field, "markerZ");
    }

    #[test]
    fn test_serialized_config_reads_back() {
        let mut config = EngineConfig::marker_spring();
        config.offset = 1.5;
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<EngineConfig>(&json).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::frame_to_target();
        config.soft_clamp_ratio = 0.9;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::frame_to_target();
        config.max_distance = 0.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::frame_to_target();
        config.field.clear();
        assert!(config.validate().is_err());
    }
}
