//! Gate counters and diagnostic snapshots.

use serde::Serialize;

use super::config::FilterToggles;

/// Running pass/fail counters.
#[derive(Debug, Clone, Default)]
pub(crate) struct GateCounters {
    pub total: u64,
    pub accepted: u64,
    pub distance_threshold: u64,
    pub velocity: u64,
    pub stability: u64,
    pub relative_movement: u64,
    pub temporal: u64,
}

/// Why the gate held a sample back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    DistanceThreshold,
    Velocity,
    Stability,
    RelativeMovement,
    Temporal,
}

impl GateCounters {
    pub fn reject(&mut self, reason: Rejection) {
        let slot = match reason {
            Rejection::DistanceThreshold => &mut self.distance_threshold,
            Rejection::Velocity => &mut self.velocity,
            Rejection::Stability => &mut self.stability,
            Rejection::RelativeMovement => &mut self.relative_movement,
            Rejection::Temporal => &mut self.temporal,
        };
        *slot += 1;
    }
}

/// Count and share of evaluations rejected by one filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FilterCount {
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterBreakdown {
    pub distance_threshold: FilterCount,
    pub velocity: FilterCount,
    pub stability: FilterCount,
    pub relative_movement: FilterCount,
    pub temporal: FilterCount,
}

/// Read-only snapshot of the gate's decisions so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateStatistics {
    pub total_evaluations: u64,
    pub accepted: u64,
    pub total_filtered: u64,
    pub filter_rate_percent: f64,
    pub filters: FilterBreakdown,
    pub filter_status: FilterToggles,
}

impl GateStatistics {
    pub(crate) fn from_counters(counters: &GateCounters, filter_status: FilterToggles) -> Self {
        let denominator = counters.total.max(1) as f64;
        let entry = |count: u64| FilterCount {
            count,
            percentage: count as f64 / denominator * 100.0,
        };
        let total_filtered = counters.total - counters.accepted;

        Self {
            total_evaluations: counters.total,
            accepted: counters.accepted,
            total_filtered,
            filter_rate_percent: total_filtered as f64 / denominator * 100.0,
            filters: FilterBreakdown {
                distance_threshold: entry(counters.distance_threshold),
                velocity: entry(counters.velocity),
                stability: entry(counters.stability),
                relative_movement: entry(counters.relative_movement),
                temporal: entry(counters.temporal),
            },
            filter_status,
        }
    }
}

/// Kinematics the gate currently sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementMetrics {
    /// Mean speed of the first tracked object, px/s.
    pub velocity_a_px_s: f64,
    /// Mean speed of the second tracked object, px/s.
    pub velocity_b_px_s: f64,
    pub relative_velocity_px_s: f64,
    /// Mean rate of change of the distance, units/s.
    pub distance_velocity: f64,
    pub a_stable: bool,
    pub b_stable: bool,
    pub stable_frames: u32,
    pub movement_detected: bool,
    pub last_sent_distance: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_statistics_percentages() {
        let mut counters = GateCounters {
            total: 8,
            accepted: 2,
            ..Default::default()
        };
        counters.reject(Rejection::DistanceThreshold);
        counters.reject(Rejection::DistanceThreshold);
        counters.reject(Rejection::Temporal);
        counters.reject(Rejection::Stability);
        counters.reject(Rejection::Stability);
        counters.reject(Rejection::Stability);

        let stats = GateStatistics::from_counters(&counters, FilterToggles::default());

        assert_eq!(stats.total_filtered, 6);
        assert_relative_eq!(stats.filter_rate_percent, 75.0);
        assert_eq!(stats.filters.stability.count, 3);
        assert_relative_eq!(stats.filters.stability.percentage, 37.5);
        assert_relative_eq!(stats.filters.temporal.percentage, 12.5);
    }

    #[test]
    fn test_statistics_empty() {
        let stats = GateStatistics::from_counters(&GateCounters::default(), FilterToggles::default());
        assert_eq!(stats.total_evaluations, 0);
        assert_relative_eq!(stats.filter_rate_percent, 0.0);
    }
}
