//! SciPy functions port.
//!
//! Ported from:
//! - scipy.optimize.least_squares (method="lm")
//!
//! License: BSD 3-Clause

pub mod least_squares;
