//! Movement gate.
//!
//! Decides per distance sample whether the change reflects real movement.
//! Filters run in a fixed order and the first failure rejects the sample:
//! distance delta, distance velocity, positional stability, relative
//! movement, temporal spacing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::config::{FilterKind, MovementConfig, MovementConfigPatch};
use super::history::RingBuffer;
use super::stats::{GateCounters, GateStatistics, MovementMetrics, Rejection};
use crate::utils::{euclidean_distance, variance, Clock, SystemClock};
use crate::Result;

/// Scale assumed for the relative movement threshold until calibrated.
pub const DEFAULT_PIXELS_PER_UNIT: f64 = 8.0;

#[derive(Debug, Clone, Copy)]
struct TimedPoint {
    x: f64,
    y: f64,
    at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct TimedValue {
    value: f64,
    at: Instant,
}

trait Timed {
    fn at(&self) -> Instant;
}

impl Timed for TimedPoint {
    fn at(&self) -> Instant {
        self.at
    }
}

impl Timed for TimedValue {
    fn at(&self) -> Instant {
        self.at
    }
}

/// Mean of `change(prev, next) / dt` over consecutive entries inside the window.
fn mean_rate<T: Timed>(history: &RingBuffer<T>, now: Instant, window: Duration, change: impl Fn(&T, &T) -> f64) -> f64 {
    let mut previous: Option<&T> = None;
    let mut sum = 0.0;
    let mut n = 0usize;

    for entry in history.iter().filter(|e| now.saturating_duration_since(e.at()) <= window) {
        if let Some(prev) = previous {
            let dt = entry.at().saturating_duration_since(prev.at()).as_secs_f64();
            if dt > 0.0 {
                sum += change(prev, entry) / dt;
                n += 1;
            }
        }
        previous = Some(entry);
    }

    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Suppresses distance samples that only reflect detector jitter.
pub struct MovementGate {
    config: MovementConfig,
    clock: Arc<dyn Clock>,
    positions_a: RingBuffer<TimedPoint>,
    positions_b: RingBuffer<TimedPoint>,
    distances: RingBuffer<TimedValue>,
    pixels_per_unit: f64,
    stable_frames: u32,
    last_sent_distance: Option<f64>,
    last_send_time: Option<Instant>,
    movement_detected: bool,
    counters: GateCounters,
}

impl MovementGate {
    pub fn new(config: MovementConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MovementConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.history_capacity();
        Self {
            config,
            clock,
            positions_a: RingBuffer::new(capacity),
            positions_b: RingBuffer::new(capacity),
            distances: RingBuffer::new(capacity),
            pixels_per_unit: DEFAULT_PIXELS_PER_UNIT,
            stable_frames: 0,
            last_sent_distance: None,
            last_send_time: None,
            movement_detected: false,
            counters: GateCounters::default(),
        }
    }

    /// Record the current positions of both tracked objects and the distance
    /// between them. Missing values are skipped.
    pub fn update(&mut self, pos_a: Option<(f64, f64)>, pos_b: Option<(f64, f64)>, distance: Option<f64>) {
        let at = self.clock.now();
        if let Some((x, y)) = pos_a {
            self.positions_a.push(TimedPoint { x, y, at });
        }
        if let Some((x, y)) = pos_b {
            self.positions_b.push(TimedPoint { x, y, at });
        }
        if let Some(value) = distance {
            self.distances.push(TimedValue { value, at });
        }
    }

    /// Decide whether `distance` should be transmitted.
    pub fn should_send(&mut self, distance: f64) -> bool {
        self.evaluate(distance).is_ok()
    }

    /// Like [`should_send`](Self::should_send) but reports which filter
    /// rejected the sample.
    pub fn evaluate(&mut self, distance: f64) -> std::result::Result<(), Rejection> {
        self.counters.total += 1;
        let now = self.clock.now();

        if !self.config.filtering.enable_movement_detection {
            self.accept(distance, now);
            return Ok(());
        }

        match self.first_rejection(distance, now) {
            Some(reason) => {
                self.counters.reject(reason);
                if self.config.debug.log_filtered_attempts {
                    tracing::debug!(distance, ?reason, "sample filtered");
                }
                Err(reason)
            }
            None => {
                self.accept(distance, now);
                Ok(())
            }
        }
    }

    fn first_rejection(&mut self, distance: f64, now: Instant) -> Option<Rejection> {
        let t = &self.config.movement_detection;

        if let Some(last) = self.last_sent_distance {
            if (distance - last).abs() < t.distance_threshold {
                return Some(Rejection::DistanceThreshold);
            }
        }

        if self.config.filtering.enable_velocity_filter && self.distance_velocity(now) < t.velocity_threshold {
            return Some(Rejection::Velocity);
        }

        if self.config.filtering.enable_stability_filter {
            if self.is_stable(&self.positions_a) && self.is_stable(&self.positions_b) {
                self.stable_frames += 1;
                return Some(Rejection::Stability);
            }
            self.stable_frames = 0;
        }

        if self.config.filtering.enable_relative_movement_filter {
            let relative = (self.velocity_px(&self.positions_a, now) - self.velocity_px(&self.positions_b, now)).abs();
            if relative <= t.velocity_threshold * self.pixels_per_unit {
                return Some(Rejection::RelativeMovement);
            }
        }

        if self.config.filtering.enable_temporal_filter {
            let min_interval = Duration::from_millis(t.min_time_between_sends_ms);
            if let Some(last) = self.last_send_time {
                if now.saturating_duration_since(last) < min_interval {
                    return Some(Rejection::Temporal);
                }
            }
        }

        None
    }

    fn accept(&mut self, distance: f64, now: Instant) {
        self.last_send_time = Some(now);
        self.last_sent_distance = Some(distance);
        self.movement_detected = true;
        self.counters.accepted += 1;

        if self.config.debug.log_movement_metrics {
            let metrics = self.metrics();
            tracing::debug!(
                distance,
                velocity_a_px_s = metrics.velocity_a_px_s,
                relative_velocity_px_s = metrics.relative_velocity_px_s,
                distance_velocity = metrics.distance_velocity,
                "movement accepted"
            );
        }
    }

    fn window(&self) -> Duration {
        Duration::try_from_secs_f64(self.config.movement_detection.temporal_window_seconds).unwrap_or(Duration::MAX)
    }

    fn velocity_px(&self, history: &RingBuffer<TimedPoint>, now: Instant) -> f64 {
        mean_rate(history, now, self.window(), |a, b| euclidean_distance((a.x, a.y), (b.x, b.y)))
    }

    fn distance_velocity(&self, now: Instant) -> f64 {
        mean_rate(&self.distances, now, self.window(), |a, b| (b.value - a.value).abs())
    }

    fn is_stable(&self, history: &RingBuffer<TimedPoint>) -> bool {
        let frames = self.config.movement_detection.position_stability_frames;
        if history.len() < frames {
            return false;
        }
        let noise = self.config.movement_detection.position_noise_threshold_px.powi(2);
        let recent = history.latest(frames);
        variance(recent.clone().map(|p| p.x)) < noise && variance(recent.map(|p| p.y)) < noise
    }

    /// Scale used to convert the velocity threshold to pixel space.
    pub fn set_pixels_per_unit(&mut self, pixels_per_unit: f64) {
        if pixels_per_unit.is_finite() && pixels_per_unit > 0.0 {
            self.pixels_per_unit = pixels_per_unit;
        }
    }

    pub fn pixels_per_unit(&self) -> f64 {
        self.pixels_per_unit
    }

    /// Swap the configuration, keeping histories and counters.
    pub fn apply_config(&mut self, config: MovementConfig) -> Result<()> {
        config.validate()?;
        let capacity = config.history_capacity();
        self.positions_a.resize(capacity);
        self.positions_b.resize(capacity);
        self.distances.resize(capacity);
        self.config = config;
        tracing::info!(
            distance_threshold = self.config.movement_detection.distance_threshold,
            velocity_threshold = self.config.movement_detection.velocity_threshold,
            stability_frames = self.config.movement_detection.position_stability_frames,
            "movement config applied"
        );
        Ok(())
    }

    pub fn apply_patch(&mut self, patch: &MovementConfigPatch) -> Result<()> {
        let mut next = self.config.clone();
        next.apply(patch)?;
        self.apply_config(next)
    }

    pub fn enable_filter(&mut self, filter: FilterKind, enabled: bool) {
        self.config.enable_filter(filter, enabled);
        tracing::info!(filter = %filter, enabled, "movement filter toggled");
    }

    /// Toggle a filter by its configuration name.
    pub fn enable_filter_by_name(&mut self, name: &str, enabled: bool) -> Result<()> {
        let filter = name.parse()?;
        self.enable_filter(filter, enabled);
        Ok(())
    }

    /// Clear the movement flag, stable frame count and send timer.
    pub fn reset_movement_detection(&mut self) {
        self.movement_detected = false;
        self.stable_frames = 0;
        self.last_send_time = None;
    }

    pub fn metrics(&self) -> MovementMetrics {
        let now = self.clock.now();
        let velocity_a = self.velocity_px(&self.positions_a, now);
        let velocity_b = self.velocity_px(&self.positions_b, now);
        MovementMetrics {
            velocity_a_px_s: velocity_a,
            velocity_b_px_s: velocity_b,
            relative_velocity_px_s: (velocity_a - velocity_b).abs(),
            distance_velocity: self.distance_velocity(now),
            a_stable: self.is_stable(&self.positions_a),
            b_stable: self.is_stable(&self.positions_b),
            stable_frames: self.stable_frames,
            movement_detected: self.movement_detected,
            last_sent_distance: self.last_sent_distance,
        }
    }

    pub fn statistics(&self) -> GateStatistics {
        GateStatistics::from_counters(&self.counters, self.config.filtering.clone())
    }

    pub fn config(&self) -> &MovementConfig {
        &self.config
    }

    pub fn last_sent_distance(&self) -> Option<f64> {
        self.last_sent_distance
    }

    pub fn stable_frames(&self) -> u32 {
        self.stable_frames
    }

    /// Number of recorded distance observations.
    pub fn history_len(&self) -> usize {
        self.distances.len()
    }
}

impl std::fmt::Debug for MovementGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MovementGate")
            .field("config", &self.config)
            .field("pixels_per_unit", &self.pixels_per_unit)
            .field("history_len", &self.distances.len())
            .field("last_sent_distance", &self.last_sent_distance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    const FRAME: Duration = Duration::from_millis(33);

    fn gate_with(config: MovementConfig) -> (MovementGate, ManualClock) {
        let clock = ManualClock::new();
        (MovementGate::with_clock(config, Arc::new(clock.clone())), clock)
    }

    fn only(filters: &[FilterKind]) -> MovementConfig {
        let mut config = MovementConfig::default();
        for kind in [
            FilterKind::Velocity,
            FilterKind::Stability,
            FilterKind::RelativeMovement,
            FilterKind::Temporal,
        ] {
            config.enable_filter(kind, filters.contains(&kind));
        }
        config
    }

    #[test]
    fn test_static_scene_sends_at_most_once() {
        let (mut gate, clock) = gate_with(MovementConfig::default());
        let mut decisions = Vec::new();

        for frame in 0..20 {
            let jitter = if frame % 2 == 0 { 0.5 } else { -0.5 };
            gate.update(Some((200.0 + jitter, 150.0)), Some((120.0, 150.0 - jitter)), Some(10.0 + jitter * 0.1));
            decisions.push(gate.should_send(10.0 + jitter * 0.1));
            clock.advance(FRAME);
        }

        let sent = decisions.iter().filter(|&&d| d).count();
        assert!(sent <= 1, "static scene sent {} samples", sent);
        if let Some(first) = decisions.iter().position(|&d| d) {
            assert!(decisions[first + 1..].iter().all(|&d| !d));
        }
    }

    #[test]
    fn test_monotonic_motion_is_sent() {
        let (mut gate, clock) = gate_with(MovementConfig::default());
        let mut sent = Vec::new();

        // 10 units over one second at 8 px/unit
        for frame in 0..=30 {
            let distance = frame as f64 / 3.0;
            let pos_a = (100.0 + distance * 8.0, 100.0);
            gate.update(Some(pos_a), Some((100.0, 100.0)), Some(distance));
            if gate.should_send(distance) {
                sent.push(distance);
            }
            clock.advance(Duration::from_millis(33));
        }

        assert!(sent.len() >= 2, "sent {:?}", sent);
        assert!(sent.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_first_sample_skips_distance_delta() {
        let (mut gate, _clock) = gate_with(only(&[]));

        assert_eq!(gate.evaluate(3.0), Ok(()));
        assert_eq!(gate.evaluate(3.2), Err(Rejection::DistanceThreshold));
        assert_eq!(gate.evaluate(3.6), Ok(()));
        assert_eq!(gate.last_sent_distance(), Some(3.6));
    }

    #[test]
    fn test_velocity_filter_uses_window() {
        let mut config = only(&[FilterKind::Velocity]);
        config.movement_detection.temporal_window_seconds = 1.0;
        let (mut gate, clock) = gate_with(config);

        gate.update(None, None, Some(0.0));
        clock.advance(Duration::from_millis(100));
        gate.update(None, None, Some(5.0));
        assert!(gate.metrics().distance_velocity > 0.2);

        // Both observations fall out of the window
        clock.advance(Duration::from_secs(3));
        assert_eq!(gate.evaluate(5.0), Err(Rejection::Velocity));
        assert_eq!(gate.metrics().distance_velocity, 0.0);
    }

    #[test]
    fn test_stability_filter_counts_stable_frames() {
        let (mut gate, clock) = gate_with(only(&[FilterKind::Stability]));

        for i in 0..5 {
            gate.update(Some((50.0, 50.0)), Some((80.0, 50.0)), Some(i as f64));
            clock.advance(FRAME);
        }
        assert_eq!(gate.evaluate(10.0), Err(Rejection::Stability));
        assert_eq!(gate.evaluate(20.0), Err(Rejection::Stability));
        assert_eq!(gate.stable_frames(), 2);

        gate.update(Some((70.0, 50.0)), Some((80.0, 50.0)), Some(10.0));
        assert_eq!(gate.evaluate(30.0), Ok(()));
        assert_eq!(gate.stable_frames(), 0);
    }

    #[test]
    fn test_relative_threshold_scales_with_calibration() {
        let run = |pixels_per_unit: Option<f64>| {
            let (mut gate, clock) = gate_with(only(&[FilterKind::RelativeMovement]));
            if let Some(ppu) = pixels_per_unit {
                gate.set_pixels_per_unit(ppu);
            }
            // 10 px/s
            for step in 0..5 {
                gate.update(Some((step as f64, 0.0)), Some((50.0, 0.0)), Some(1.0));
                clock.advance(Duration::from_millis(100));
            }
            gate.evaluate(1.0)
        };

        assert_eq!(run(None), Ok(()));
        assert_eq!(run(Some(100.0)), Err(Rejection::RelativeMovement));
    }

    #[test]
    fn test_temporal_spacing() {
        let (mut gate, clock) = gate_with(only(&[FilterKind::Temporal]));

        assert!(gate.should_send(1.0));
        clock.advance(Duration::from_millis(100));
        assert_eq!(gate.evaluate(5.0), Err(Rejection::Temporal));
        clock.advance(Duration::from_millis(450));
        assert!(gate.should_send(9.0));
    }

    #[test]
    fn test_master_switch_accepts_everything() {
        let mut config = MovementConfig::default();
        config.enable_filter(FilterKind::MovementDetection, false);
        let (mut gate, _clock) = gate_with(config);

        for _ in 0..5 {
            assert!(gate.should_send(1.0));
        }
        let stats = gate.statistics();
        assert_eq!(stats.total_evaluations, 5);
        assert_eq!(stats.accepted, 5);
        assert_eq!(stats.total_filtered, 0);
    }

    #[test]
    fn test_statistics_track_rejections() {
        let (mut gate, clock) = gate_with(only(&[FilterKind::Temporal]));

        gate.should_send(1.0);
        gate.should_send(1.1);
        gate.should_send(5.0);
        clock.advance(Duration::from_secs(1));
        gate.should_send(9.0);

        let stats = gate.statistics();
        assert_eq!(stats.total_evaluations, 4);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.filters.distance_threshold.count, 1);
        assert_eq!(stats.filters.temporal.count, 1);
        assert_eq!(stats.filters.temporal.percentage, 25.0);
        assert!(!stats.filter_status.enable_velocity_filter);
    }

    #[test]
    fn test_history_capacity_bounded() {
        let (mut gate, _clock) = gate_with(MovementConfig::default());
        for i in 0..100 {
            gate.update(Some((i as f64, 0.0)), Some((0.0, 0.0)), Some(i as f64));
        }
        assert_eq!(gate.history_len(), 20);
    }

    #[test]
    fn test_apply_config_preserves_history() {
        let (mut gate, clock) = gate_with(MovementConfig::default());
        for i in 0..10 {
            gate.update(Some((i as f64, 0.0)), Some((0.0, 0.0)), Some(i as f64));
            clock.advance(FRAME);
        }

        let mut config = MovementConfig::default();
        config.movement_detection.distance_threshold = 2.0;
        config.movement_detection.position_stability_frames = 15;
        gate.apply_config(config).unwrap();

        assert_eq!(gate.history_len(), 10);
        assert_eq!(gate.config().movement_detection.distance_threshold, 2.0);
        assert!(gate.metrics().velocity_a_px_s > 0.0);

        let mut bad = MovementConfig::default();
        bad.movement_detection.velocity_threshold = -1.0;
        assert!(gate.apply_config(bad).is_err());
        assert_eq!(gate.config().movement_detection.distance_threshold, 2.0);
    }

    #[test]
    fn test_apply_patch_and_toggle_by_name() {
        let (mut gate, _clock) = gate_with(MovementConfig::default());

        gate.apply_patch(&MovementConfigPatch {
            min_time_between_sends_ms: Some(1000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(gate.config().movement_detection.min_time_between_sends_ms, 1000);

        gate.enable_filter_by_name("velocity", false).unwrap();
        assert!(!gate.config().filtering.enable_velocity_filter);
        assert!(gate.enable_filter_by_name("nope", true).is_err());
    }

    #[test]
    fn test_reset_movement_detection() {
        let (mut gate, _clock) = gate_with(only(&[FilterKind::Temporal]));
        assert!(gate.should_send(1.0));
        assert!(gate.metrics().movement_detected);

        gate.reset_movement_detection();
        let metrics = gate.metrics();
        assert!(!metrics.movement_detected);
        assert_eq!(metrics.stable_frames, 0);
        // Send timer cleared, so the temporal filter lets the next change through
        assert!(gate.should_send(5.0));
    }
}
