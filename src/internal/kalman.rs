//! Linear Kalman filter.
//!
//! Follows the predict/correct split used by `cv2.KalmanFilter` and
//! `filterpy.kalman.KalmanFilter`: `predict` propagates the state with the
//! transition model and `correct` folds in a measurement.

use nalgebra::{DMatrix, DVector};

/// Standard linear Kalman filter with dense matrices.
#[derive(Clone, Debug)]
pub struct KalmanFilter {
    /// State dimension
    pub dim_x: usize,
    /// Measurement dimension
    pub dim_z: usize,
    /// State vector
    pub x: DVector<f64>,
    /// State covariance matrix
    pub p: DMatrix<f64>,
    /// State transition matrix
    pub f: DMatrix<f64>,
    /// Measurement matrix
    pub h: DMatrix<f64>,
    /// Measurement noise covariance
    pub r: DMatrix<f64>,
    /// Process noise covariance
    pub q: DMatrix<f64>,
}

impl KalmanFilter {
    /// Create a filter with identity transition/covariance and an `H` that
    /// observes the leading `dim_z` state entries.
    pub fn new(dim_x: usize, dim_z: usize) -> Self {
        let mut h = DMatrix::zeros(dim_z, dim_x);
        for i in 0..dim_z.min(dim_x) {
            h[(i, i)] = 1.0;
        }

        Self {
            dim_x,
            dim_z,
            x: DVector::zeros(dim_x),
            p: DMatrix::identity(dim_x, dim_x),
            f: DMatrix::identity(dim_x, dim_x),
            h,
            r: DMatrix::identity(dim_z, dim_z),
            q: DMatrix::identity(dim_x, dim_x),
        }
    }

    /// Propagate state and covariance one step and return the a-priori state.
    pub fn predict(&mut self) -> &DVector<f64> {
        // x = F @ x
        self.x = &self.f * &self.x;
        // P = F @ P @ F.T + Q
        self.p = &self.f * &self.p * self.f.transpose() + &self.q;
        &self.x
    }

    /// Correct the state with a measurement.
    ///
    /// Returns `false` and leaves the state untouched when the innovation
    /// covariance is singular.
    pub fn correct(&mut self, z: &DVector<f64>) -> bool {
        // y = z - H @ x
        let y = z - &self.h * &self.x;
        // S = H @ P @ H.T + R
        let s = &self.h * &self.p * self.h.transpose() + &self.r;
        let Some(si) = s.try_inverse() else {
            return false;
        };
        // K = P @ H.T @ S^-1
        let k = &self.p * self.h.transpose() * si;

        self.x += &k * y;
        let i = DMatrix::identity(self.dim_x, self.dim_x);
        self.p = (i - &k * &self.h) * &self.p;
        true
    }

    /// Current state estimate.
    pub fn state(&self) -> &DVector<f64> {
        &self.x
    }

    /// Current state covariance.
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_kalman_filter_create() {
        let kf = KalmanFilter::new(4, 2);

        assert_eq!(kf.dim_x, 4);
        assert_eq!(kf.dim_z, 2);
        assert_eq!(kf.x.len(), 4);
        assert_eq!(kf.p.shape(), (4, 4));

        for i in 0..2 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(kf.h[(i, j)], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_kalman_filter_predict_constant_velocity() {
        let mut kf = KalmanFilter::new(2, 1);
        kf.x = DVector::from_vec(vec![1.0, 2.0]);
        kf.f = DMatrix::from_row_slice(2, 2, &[
            1.0, 1.0,
            0.0, 1.0,
        ]);
        kf.q = DMatrix::identity(2, 2) * 0.1;

        let predicted = kf.predict().clone();

        assert_relative_eq!(predicted[0], 3.0, epsilon = 1e-10);
        assert_relative_eq!(predicted[1], 2.0, epsilon = 1e-10);
        // P = F P F' + Q with P = I
        assert_relative_eq!(kf.p[(0, 0)], 2.1, epsilon = 1e-10);
        assert_relative_eq!(kf.p[(0, 1)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(kf.p[(1, 1)], 1.1, epsilon = 1e-10);
    }

    #[test]
    fn test_kalman_filter_correct_moves_toward_measurement() {
        let mut kf = KalmanFilter::new(2, 1);
        kf.h = DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        kf.r = DMatrix::from_row_slice(1, 1, &[1.0]);
        kf.p = DMatrix::identity(2, 2) * 10.0;

        assert!(kf.correct(&DVector::from_vec(vec![5.0])));

        // K = 10 / (10 + 1)
        assert_relative_eq!(kf.x[0], 50.0 / 11.0, epsilon = 1e-9);
        assert_relative_eq!(kf.x[1], 0.0, epsilon = 1e-10);
        assert!(kf.covariance()[(0, 0)] < 10.0);
    }

    #[test]
    fn test_kalman_filter_singular_innovation_is_skipped() {
        let mut kf = KalmanFilter::new(2, 1);
        kf.p = DMatrix::zeros(2, 2);
        kf.r = DMatrix::zeros(1, 1);
        kf.x = DVector::from_vec(vec![1.0, 0.0]);

        assert!(!kf.correct(&DVector::from_vec(vec![9.0])));
        assert_relative_eq!(kf.state()[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_kalman_filter_tracks_linear_motion() {
        let mut kf = KalmanFilter::new(2, 1);
        kf.f = DMatrix::from_row_slice(2, 2, &[
            1.0, 1.0,
            0.0, 1.0,
        ]);
        kf.q = DMatrix::identity(2, 2) * 0.01;
        kf.r = DMatrix::from_row_slice(1, 1, &[0.1]);

        for (i, z) in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0].iter().enumerate() {
            kf.predict();
            kf.correct(&DVector::from_vec(vec![*z]));
            if i >= 3 {
                assert!((kf.x[0] - z).abs() < 0.5, "step {}: position {}", i, kf.x[0]);
                assert!((kf.x[1] - 1.0).abs() < 0.5, "step {}: velocity {}", i, kf.x[1]);
            }
        }
    }
}
