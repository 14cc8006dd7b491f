//! Physical distance between two tracked points.

use std::sync::Arc;

use serde::Serialize;

use super::config::{EngineConfig, MeasurementKind};
use super::points::{marker_points, reference_corner, target_centroid};
use super::sample::{DistanceSample, DistanceSink};
use crate::calibration::AutoCalibrator;
use crate::detection::{find_with_keypoints, DetectionRecord};
use crate::filter::KeypointStabilizer;
use crate::geometry::GeometryRectifier;
use crate::movement::{GateStatistics, MovementConfig, MovementGate, MovementMetrics, RingBuffer};
use crate::utils::{euclidean_distance, recency_weighted_mean, Clock, SystemClock};
use crate::Result;

/// Apply the non-negative floor and the soft/hard ceiling.
///
/// Values in `(max, max * ratio)` come back as `max`; values at or above
/// `max * ratio` are rejected.
pub fn clamp_distance(distance: f64, max_distance: f64, soft_clamp_ratio: f64) -> Option<f64> {
    if !distance.is_finite() {
        return None;
    }
    let distance = distance.max(0.0);
    if distance <= max_distance {
        Some(distance)
    } else if distance < max_distance * soft_clamp_ratio {
        Some(max_distance)
    } else {
        None
    }
}

#[derive(Debug, Clone, Default)]
struct EngineCounters {
    frames: u64,
    measured: u64,
    missing: u64,
    out_of_range: u64,
    soft_clamped: u64,
    sent: u64,
}

/// Read-only snapshot of an engine's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineDiagnostics {
    pub field: String,
    pub pixels_per_unit: f64,
    pub converged: bool,
    pub frames: u64,
    pub measured: u64,
    pub missing: u64,
    pub out_of_range: u64,
    pub soft_clamped: u64,
    pub sent: u64,
    pub last_distance: Option<f64>,
    pub gate: GateStatistics,
    pub movement: MovementMetrics,
}

/// Turns a frame's detections into a distance in physical units.
///
/// Owns the calibration, stabilization and movement gate state for one
/// measurement. Accepted samples go to the attached [`DistanceSink`].
pub struct DistanceEngine {
    config: EngineConfig,
    calibrator: AutoCalibrator,
    rectifier: GeometryRectifier,
    stabilizer: KeypointStabilizer,
    gate: MovementGate,
    centroids: RingBuffer<(f64, f64)>,
    sink: Option<Arc<dyn DistanceSink>>,
    clock: Arc<dyn Clock>,
    last_distance: Option<f64>,
    counters: EngineCounters,
}

impl DistanceEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an engine whose movement gate and sample timestamps read time
    /// from `clock`.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let rectifier = GeometryRectifier::new(config.frame_width, config.frame_height, config.geometry_error_threshold);
        Self {
            calibrator: AutoCalibrator::new(config.calibration.clone()),
            rectifier,
            stabilizer: KeypointStabilizer::from_config(&config.stabilizer),
            gate: MovementGate::with_clock(config.movement.clone(), Arc::clone(&clock)),
            centroids: RingBuffer::new(config.smoothing_window.max(1)),
            sink: None,
            clock,
            last_distance: None,
            counters: EngineCounters::default(),
            config,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn DistanceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn set_sink(&mut self, sink: Option<Arc<dyn DistanceSink>>) {
        self.sink = sink;
    }

    /// Compute this frame's distance.
    ///
    /// Drives calibration until it converges and feeds the movement gate
    /// even when the gate holds the sample back. Returns `None` when either
    /// point is unavailable or the distance is implausibly large.
    pub fn compute(&mut self, detections: &[DetectionRecord]) -> Option<f64> {
        self.counters.frames += 1;

        if !self.calibrator.is_converged() {
            self.calibrate(detections);
        }

        let Some((a, b)) = self.measurement_points(detections) else {
            self.counters.missing += 1;
            return None;
        };

        let ppu = self.calibrator.pixels_per_unit();
        let raw = euclidean_distance(a, b) / ppu + self.config.offset;
        let Some(distance) = clamp_distance(raw, self.config.max_distance, self.config.soft_clamp_ratio) else {
            self.counters.out_of_range += 1;
            tracing::debug!(field = %self.config.field, distance = raw, "distance out of range");
            return None;
        };
        if distance < raw {
            self.counters.soft_clamped += 1;
        }
        self.counters.measured += 1;
        self.last_distance = Some(distance);

        self.gate.update(Some(a), Some(b), Some(distance));
        self.gate.set_pixels_per_unit(ppu);
        if self.gate.should_send(distance) {
            self.counters.sent += 1;
            if let Some(sink) = &self.sink {
                sink.accept(DistanceSample::at(distance, self.clock.utc_now(), self.config.field.clone()));
            }
        }

        Some(distance)
    }

    fn calibrate(&mut self, detections: &[DetectionRecord]) {
        let Some(reference) =
            find_with_keypoints(detections, &self.config.labels.reference_frame).and_then(DetectionRecord::keypoint_set)
        else {
            return;
        };
        if self.calibrator.calibrate(&reference) {
            self.gate.set_pixels_per_unit(self.calibrator.pixels_per_unit());
        }
    }

    fn measurement_points(&mut self, detections: &[DetectionRecord]) -> Option<((f64, f64), (f64, f64))> {
        let labels = &self.config.labels;
        match self.config.kind {
            MeasurementKind::FrameToTarget => {
                let centroid = target_centroid(detections, &labels.moving_part, &mut self.stabilizer)?;
                let corner = reference_corner(detections, &labels.reference_frame, &self.rectifier, &mut self.stabilizer)?;

                self.centroids.push(centroid);
                let smoothed = (
                    recency_weighted_mean(self.centroids.iter().map(|c| c.0), -0.5)?,
                    recency_weighted_mean(self.centroids.iter().map(|c| c.1), -0.5)?,
                );
                Some((smoothed, corner))
            }
            MeasurementKind::MarkerSpring => marker_points(detections, &labels.marker, &mut self.stabilizer),
        }
    }

    /// Forget calibration history so the next frames recalibrate.
    pub fn reset_calibration(&mut self) {
        self.calibrator.reset();
    }

    /// Hot-swap the movement gate thresholds.
    pub fn reload_movement_config(&mut self, config: MovementConfig) -> Result<()> {
        self.gate.apply_config(config.clone())?;
        self.config.movement = config;
        Ok(())
    }

    pub fn diagnostics(&self) -> EngineDiagnostics {
        let c = &self.counters;
        EngineDiagnostics {
            field: self.config.field.clone(),
            pixels_per_unit: self.calibrator.pixels_per_unit(),
            converged: self.calibrator.is_converged(),
            frames: c.frames,
            measured: c.measured,
            missing: c.missing,
            out_of_range: c.out_of_range,
            soft_clamped: c.soft_clamped,
            sent: c.sent,
            last_distance: self.last_distance,
            gate: self.gate.statistics(),
            movement: self.gate.metrics(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn calibrator(&self) -> &AutoCalibrator {
        &self.calibrator
    }

    pub fn calibrator_mut(&mut self) -> &mut AutoCalibrator {
        &mut self.calibrator
    }

    pub fn gate(&self) -> &MovementGate {
        &self.gate
    }

    pub fn gate_mut(&mut self) -> &mut MovementGate {
        &mut self.gate
    }
}

impl std::fmt::Debug for DistanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistanceEngine")
            .field("field", &self.config.field)
            .field("kind", &self.config.kind)
            .field("pixels_per_unit", &self.calibrator.pixels_per_unit())
            .field("converged", &self.calibrator.is_converged())
            .finish()
    }
}
