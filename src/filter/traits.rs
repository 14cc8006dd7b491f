//! Filter traits for keypoint stabilization.

use nalgebra::DVector;

/// Trait for recursive position filters.
///
/// A filter tracks one keypoint. The state holds position followed by
/// velocity; measurements are positions only.
pub trait Filter: Send + Sync {
    /// Advance the state one frame and return the predicted position.
    fn predict(&mut self) -> DVector<f64>;

    /// Fold a position measurement (dim_z x 1) into the state.
    fn update(&mut self, measurement: &DVector<f64>);

    /// Current position estimate.
    fn get_state(&self) -> DVector<f64>;

    /// Full state vector (position + velocity).
    fn get_state_vector(&self) -> &DVector<f64>;

    /// Get the measurement dimension.
    fn dim_z(&self) -> usize;

    /// Get the state dimension.
    fn dim_x(&self) -> usize;
}

/// Factory for creating filter instances.
///
/// The stabilizer creates one filter per keypoint identity without knowing
/// the concrete filter type.
pub trait FilterFactory: Send + Sync {
    /// Create a new filter at `initial_position` with zero velocity.
    fn create_filter(&self, initial_position: &DVector<f64>) -> Box<dyn Filter>;
}
