//! Pixel-to-unit calibration from the reference frame.
//!
//! The distance between two reference corners is known in physical units.
//! Every observation of both corners yields a candidate scale; the current
//! scale is a recency-weighted mean over a short history of candidates.

use serde::{Deserialize, Serialize};

use crate::detection::KeypointSet;
use crate::geometry::{CORNER_B, CORNER_C};
use crate::movement::RingBuffer;
use crate::utils::{euclidean_distance, recency_weighted_mean};
use crate::{Error, Result};

/// Calibration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Physical distance between the two reference corners.
    pub reference_length: f64,
    /// Index of the first reference corner in the reference frame keypoints.
    pub first_corner: usize,
    /// Index of the second reference corner.
    pub second_corner: usize,
    /// Number of candidate scales kept for averaging.
    pub history_len: usize,
    /// Scale used until the first calibration sample arrives.
    pub initial_pixels_per_unit: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            reference_length: 21.0,
            first_corner: CORNER_C,
            second_corner: CORNER_B,
            history_len: 10,
            initial_pixels_per_unit: 10.0,
        }
    }
}

/// Current calibration and the samples it was derived from.
#[derive(Debug, Clone)]
pub struct CalibrationState {
    pub pixels_per_unit: f64,
    pub converged: bool,
    history: RingBuffer<f64>,
}

impl CalibrationState {
    fn new(initial_pixels_per_unit: f64, history_len: usize) -> Self {
        Self {
            pixels_per_unit: initial_pixels_per_unit,
            converged: false,
            history: RingBuffer::new(history_len.max(1)),
        }
    }

    /// Candidate scales, oldest first.
    pub fn history(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }

    pub fn samples(&self) -> usize {
        self.history.len()
    }
}

/// Derives pixels-per-unit from two reference corners.
#[derive(Debug, Clone)]
pub struct AutoCalibrator {
    config: CalibrationConfig,
    state: CalibrationState,
}

impl AutoCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        let state = CalibrationState::new(config.initial_pixels_per_unit, config.history_len);
        Self { config, state }
    }

    /// Absorb one observation of the reference frame.
    ///
    /// Returns `true` when both reference corners were valid and a new
    /// candidate scale was folded in.
    pub fn calibrate(&mut self, reference: &KeypointSet) -> bool {
        let (Some(first), Some(second)) = (
            reference.valid(self.config.first_corner),
            reference.valid(self.config.second_corner),
        ) else {
            return false;
        };

        let pixels = euclidean_distance(first.position(), second.position());
        if pixels <= 0.0 || !pixels.is_finite() {
            return false;
        }

        self.state.history.push(pixels / self.config.reference_length);
        let Some(scale) = recency_weighted_mean(self.state.history.iter().copied(), -1.0) else {
            return false;
        };

        let was_converged = self.state.converged;
        self.state.pixels_per_unit = scale;
        self.state.converged = true;
        if !was_converged {
            tracing::info!(
                pixels_per_unit = scale,
                reference_px = pixels,
                "calibration converged"
            );
        }
        true
    }

    /// Set the scale by hand and mark it converged.
    pub fn set_pixels_per_unit(&mut self, pixels_per_unit: f64) -> Result<()> {
        if !(pixels_per_unit.is_finite() && pixels_per_unit > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "pixels_per_unit must be positive, got {}",
                pixels_per_unit
            )));
        }
        self.state.history.clear();
        self.state.history.push(pixels_per_unit);
        self.state.pixels_per_unit = pixels_per_unit;
        self.state.converged = true;
        Ok(())
    }

    /// Forget the history so the next observations recalibrate.
    ///
    /// The last scale stays in effect until a new sample arrives.
    pub fn reset(&mut self) {
        self.state.history.clear();
        self.state.converged = false;
        tracing::info!("calibration reset");
    }

    pub fn pixels_per_unit(&self) -> f64 {
        self.state.pixels_per_unit
    }

    pub fn is_converged(&self) -> bool {
        self.state.converged
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }
}

impl Default for AutoCalibrator {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}
