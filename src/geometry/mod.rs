//! Rigid reference frame geometry.
//!
//! The reference frame is a rectangle with known physical proportions whose
//! corners arrive as keypoints A, B, C, D. [`GeometryRectifier`] checks the
//! observed proportions and, when they are off, replaces the corners with
//! the best-fitting rectangle.

mod rectifier;

pub use rectifier::{GeometryRectifier, RectangleFit, CORNER_A, CORNER_B, CORNER_C, CORNER_D};
