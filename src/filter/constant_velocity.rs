//! Constant-velocity Kalman filter for a single keypoint.
//!
//! State is `[x, y, vx, vy]` with a one-frame time step; the measurement is
//! `[x, y]`. Process noise is kept well below measurement noise so the
//! filter leans on its own prediction through single-frame jitter.

use nalgebra::{DMatrix, DVector};

use super::traits::{Filter, FilterFactory};
use crate::internal::kalman::KalmanFilter;

/// Kalman filter with a constant-velocity transition model.
#[derive(Clone, Debug)]
pub struct ConstantVelocityFilter {
    kf: KalmanFilter,
}

impl ConstantVelocityFilter {
    /// Create a filter at `initial_position` with zero velocity.
    ///
    /// # Arguments
    /// * `initial_position` - First observed position (dim_z x 1)
    /// * `process_noise` - Diagonal of Q
    /// * `measurement_noise` - Diagonal of R
    /// * `initial_covariance` - Diagonal of the initial P
    pub fn new(initial_position: &DVector<f64>, process_noise: f64, measurement_noise: f64, initial_covariance: f64) -> Self {
        let dim_z = initial_position.len();
        let dim_x = dim_z * 2;

        let mut kf = KalmanFilter::new(dim_x, dim_z);
        kf.x.rows_mut(0, dim_z).copy_from(initial_position);

        // F = [I, I; 0, I]
        for i in 0..dim_z {
            kf.f[(i, dim_z + i)] = 1.0;
        }

        kf.q = DMatrix::identity(dim_x, dim_x) * process_noise;
        kf.r = DMatrix::identity(dim_z, dim_z) * measurement_noise;
        kf.p = DMatrix::identity(dim_x, dim_x) * initial_covariance;

        Self { kf }
    }

    /// Velocity estimate in pixels per frame.
    pub fn velocity(&self) -> DVector<f64> {
        self.kf.x.rows(self.kf.dim_z, self.kf.dim_z).into_owned()
    }
}

impl Filter for ConstantVelocityFilter {
    fn predict(&mut self) -> DVector<f64> {
        let dim_z = self.kf.dim_z;
        self.kf.predict().rows(0, dim_z).into_owned()
    }

    fn update(&mut self, measurement: &DVector<f64>) {
        if !self.kf.correct(measurement) {
            tracing::warn!("singular innovation covariance, measurement skipped");
        }
    }

    fn get_state(&self) -> DVector<f64> {
        self.kf.state().rows(0, self.kf.dim_z).into_owned()
    }

    fn get_state_vector(&self) -> &DVector<f64> {
        self.kf.state()
    }

    fn dim_z(&self) -> usize {
        self.kf.dim_z
    }

    fn dim_x(&self) -> usize {
        self.kf.dim_x
    }
}

/// Factory for creating [`ConstantVelocityFilter`] instances.
#[derive(Clone, Debug)]
pub struct ConstantVelocityFilterFactory {
    process_noise: f64,
    measurement_noise: f64,
    initial_covariance: f64,
}

impl ConstantVelocityFilterFactory {
    pub fn new(process_noise: f64, measurement_noise: f64, initial_covariance: f64) -> Self {
        Self {
            process_noise,
            measurement_noise,
            initial_covariance,
        }
    }

    #[inline(always)]
    pub fn process_noise(&self) -> f64 {
        self.process_noise
    }

    #[inline(always)]
    pub fn measurement_noise(&self) -> f64 {
        self.measurement_noise
    }
}

impl Default for ConstantVelocityFilterFactory {
    fn default() -> Self {
        Self::new(1e-3, 1e-1, 1e-1)
    }
}

impl FilterFactory for ConstantVelocityFilterFactory {
    fn create_filter(&self, initial_position: &DVector<f64>) -> Box<dyn Filter> {
        Box::new(ConstantVelocityFilter::new(
            initial_position,
            self.process_noise,
            self.measurement_noise,
            self.initial_covariance,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_constant_velocity_create() {
        let factory = ConstantVelocityFilterFactory::default();
        let filter = factory.create_filter(&DVector::from_vec(vec![10.0, 20.0]));

        assert_eq!(filter.dim_z(), 2);
        assert_eq!(filter.dim_x(), 4);

        let state = filter.get_state_vector();
        assert_relative_eq!(state[0], 10.0);
        assert_relative_eq!(state[1], 20.0);
        assert_relative_eq!(state[2], 0.0);
        assert_relative_eq!(state[3], 0.0);
    }

    #[test]
    fn test_constant_velocity_predict_static() {
        let factory = ConstantVelocityFilterFactory::default();
        let mut filter = factory.create_filter(&DVector::from_vec(vec![5.0, 5.0]));

        let predicted = filter.predict();
        assert_relative_eq!(predicted[0], 5.0, epsilon = 1e-12);
        assert_relative_eq!(predicted[1], 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_velocity_learns_velocity() {
        let mut filter = ConstantVelocityFilter::new(&DVector::from_vec(vec![0.0, 0.0]), 1e-3, 1e-1, 1e-1);

        for step in 1..=30 {
            filter.predict();
            filter.update(&DVector::from_vec(vec![2.0 * step as f64, 0.0]));
        }

        let velocity = filter.velocity();
        assert_relative_eq!(velocity[0], 2.0, epsilon = 0.2);
        assert_relative_eq!(velocity[1], 0.0, epsilon = 0.05);

        let predicted = filter.predict();
        assert_relative_eq!(predicted[0], 62.0, epsilon = 1.0);
    }

    #[test]
    fn test_constant_velocity_update_pulls_toward_measurement() {
        let mut filter = ConstantVelocityFilter::new(&DVector::from_vec(vec![0.0, 0.0]), 1e-3, 1e-1, 1e-1);

        filter.predict();
        filter.update(&DVector::from_vec(vec![1.0, -1.0]));

        let state = filter.get_state();
        assert!(state[0] > 0.0 && state[0] < 1.0, "x = {}", state[0]);
        assert!(state[1] < 0.0 && state[1] > -1.0, "y = {}", state[1]);
    }
}
