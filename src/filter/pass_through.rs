//! Filter that reports the last measurement unchanged.
//!
//! Baseline for comparison and for deployments that want raw keypoints.

use nalgebra::DVector;

use super::traits::{Filter, FilterFactory};

/// Stores the last measurement as the state; velocity stays zero.
#[derive(Clone, Debug)]
pub struct PassThroughFilter {
    x: DVector<f64>,
    dim_z: usize,
}

impl PassThroughFilter {
    pub fn new(initial_position: &DVector<f64>) -> Self {
        let dim_z = initial_position.len();
        let mut x = DVector::zeros(dim_z * 2);
        x.rows_mut(0, dim_z).copy_from(initial_position);
        Self { x, dim_z }
    }
}

impl Filter for PassThroughFilter {
    fn predict(&mut self) -> DVector<f64> {
        self.get_state()
    }

    fn update(&mut self, measurement: &DVector<f64>) {
        for i in 0..self.dim_z.min(measurement.len()) {
            self.x[i] = measurement[i];
        }
    }

    fn get_state(&self) -> DVector<f64> {
        self.x.rows(0, self.dim_z).into_owned()
    }

    fn get_state_vector(&self) -> &DVector<f64> {
        &self.x
    }

    fn dim_z(&self) -> usize {
        self.dim_z
    }

    fn dim_x(&self) -> usize {
        self.dim_z * 2
    }
}

/// Factory for creating [`PassThroughFilter`] instances.
#[derive(Clone, Debug, Default)]
pub struct PassThroughFilterFactory;

impl PassThroughFilterFactory {
    pub fn new() -> Self {
        Self
    }
}

impl FilterFactory for PassThroughFilterFactory {
    fn create_filter(&self, initial_position: &DVector<f64>) -> Box<dyn Filter> {
        Box::new(PassThroughFilter::new(initial_position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pass_through_create() {
        let filter = PassThroughFilterFactory::new().create_filter(&DVector::from_vec(vec![1.0, 2.0]));

        assert_eq!(filter.dim_z(), 2);
        assert_eq!(filter.dim_x(), 4);
        assert_relative_eq!(filter.get_state()[1], 2.0);
    }

    #[test]
    fn test_pass_through_predict_is_last_measurement() {
        let mut filter = PassThroughFilter::new(&DVector::from_vec(vec![1.0, 1.0]));

        filter.update(&DVector::from_vec(vec![7.0, 8.0]));
        let predicted = filter.predict();

        assert_relative_eq!(predicted[0], 7.0, epsilon = 1e-10);
        assert_relative_eq!(predicted[1], 8.0, epsilon = 1e-10);
        assert_relative_eq!(filter.get_state_vector()[2], 0.0);
    }
}
