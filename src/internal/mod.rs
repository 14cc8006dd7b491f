//! Internal numerical routines.
//!
//! These modules contain code adapted from:
//! - filterpy / OpenCV: linear Kalman filtering
//! - scipy: nonlinear least squares (Levenberg-Marquardt)

pub mod kalman;
pub mod scipy;
