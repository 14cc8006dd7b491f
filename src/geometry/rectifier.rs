//! Rectangle validation and least-squares rectification.

use nalgebra::DVector;

use crate::detection::KeypointSet;
use crate::internal::scipy::least_squares::{least_squares, LeastSquaresOptions};
use crate::utils::euclidean_distance;

pub const CORNER_A: usize = 0;
pub const CORNER_B: usize = 1;
pub const CORNER_C: usize = 2;
pub const CORNER_D: usize = 3;

/// Corner offsets in the rectangle's local frame, scaled by (w/2, h/2).
const LOCAL_CORNERS: [(f64, f64); 4] = [(-1.0, -1.0), (-1.0, 1.0), (1.0, 1.0), (1.0, -1.0)];

/// Rectangle fitted to four observed corners, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectangleFit {
    pub center: (f64, f64),
    /// Extent along the A→D edge.
    pub width_px: f64,
    /// Extent along the A→B edge.
    pub height_px: f64,
    /// Rotation in radians.
    pub rotation: f64,
    /// Final least-squares cost.
    pub cost: f64,
}

impl RectangleFit {
    fn from_params(p: &DVector<f64>, cost: f64) -> Self {
        Self {
            center: (p[0], p[1]),
            width_px: p[2],
            height_px: p[3],
            rotation: p[4],
            cost,
        }
    }

    /// Corners A, B, C, D implied by the fit.
    pub fn corners(&self) -> [(f64, f64); 4] {
        rectangle_corners(self.center, self.width_px, self.height_px, self.rotation)
    }
}

fn rectangle_corners(center: (f64, f64), w: f64, h: f64, rotation: f64) -> [(f64, f64); 4] {
    let (sin, cos) = rotation.sin_cos();
    LOCAL_CORNERS.map(|(u, v)| {
        let (lx, ly) = (u * w / 2.0, v * h / 2.0);
        (center.0 + lx * cos - ly * sin, center.1 + lx * sin + ly * cos)
    })
}

/// Validates and repairs the four corners of a rectangle of known proportions.
#[derive(Debug, Clone)]
pub struct GeometryRectifier {
    width: f64,
    height: f64,
    error_threshold: f64,
    options: LeastSquaresOptions,
}

impl GeometryRectifier {
    /// # Arguments
    /// * `width` - Physical length of edge D-C
    /// * `height` - Physical length of edge C-B
    /// * `error_threshold` - Allowed relative error of the edge ratio
    pub fn new(width: f64, height: f64, error_threshold: f64) -> Self {
        Self {
            width,
            height,
            error_threshold,
            options: LeastSquaresOptions::default(),
        }
    }

    /// Expected long/short edge ratio.
    pub fn expected_ratio(&self) -> f64 {
        self.width.max(self.height) / self.width.min(self.height)
    }

    /// True when the first four points are valid and the D-C / C-B edge
    /// ratio is within the error threshold of the expected ratio.
    pub fn validate(&self, corners: &KeypointSet) -> bool {
        let Some(points) = valid_corners(corners) else {
            return false;
        };

        let dc = euclidean_distance(points[CORNER_D], points[CORNER_C]);
        let cb = euclidean_distance(points[CORNER_C], points[CORNER_B]);
        if dc <= 0.0 || cb <= 0.0 {
            return false;
        }

        let ratio = dc.max(cb) / dc.min(cb);
        let expected = self.expected_ratio();
        (ratio - expected).abs() / expected < self.error_threshold
    }

    /// Fit a rectangle to the first four corners.
    ///
    /// Returns `None` when fewer than four corners are valid or the solver
    /// does not converge.
    pub fn fit(&self, corners: &KeypointSet) -> Option<RectangleFit> {
        let points = valid_corners(corners)?;
        let weights: Vec<f64> = corners.scores[..4].to_vec();

        let [a, b, c, d] = points;
        let center = (
            points.iter().map(|p| p.0).sum::<f64>() / 4.0,
            points.iter().map(|p| p.1).sum::<f64>() / 4.0,
        );
        let w = (euclidean_distance(b, c) + euclidean_distance(a, d)) / 2.0;
        let h = (euclidean_distance(a, b) + euclidean_distance(d, c)) / 2.0;
        let rotation = (c.1 - b.1).atan2(c.0 - b.0);
        let x0 = DVector::from_vec(vec![center.0, center.1, w, h, rotation]);

        let residuals = |p: &DVector<f64>| {
            let model = rectangle_corners((p[0], p[1]), p[2], p[3], p[4]);
            DVector::from_iterator(
                8,
                points
                    .iter()
                    .zip(model.iter())
                    .zip(weights.iter())
                    .flat_map(|((obs, fit), w)| [(obs.0 - fit.0) * w, (obs.1 - fit.1) * w]),
            )
        };

        let result = least_squares(residuals, &x0, &self.options);
        if !result.success() {
            tracing::debug!(status = ?result.status, nfev = result.nfev, "rectangle fit did not converge");
            return None;
        }
        Some(RectangleFit::from_params(&result.x, result.cost))
    }

    /// Return the corners unchanged when they validate, otherwise the fitted
    /// rectangle's corners with the original confidences.
    ///
    /// Points past the fourth are carried over untouched. When the corners
    /// cannot be fitted the input comes back unchanged and the caller should
    /// treat the geometry as unavailable.
    pub fn rectify(&self, corners: &KeypointSet) -> KeypointSet {
        if self.validate(corners) {
            return corners.clone();
        }

        let Some(fit) = self.fit(corners) else {
            return corners.clone();
        };

        let mut rectified = corners.clone();
        for (i, (x, y)) in fit.corners().into_iter().enumerate() {
            rectified.points[(i, 0)] = x;
            rectified.points[(i, 1)] = y;
        }
        tracing::debug!(
            label = %corners.label,
            width_px = fit.width_px,
            height_px = fit.height_px,
            rotation = fit.rotation,
            cost = fit.cost,
            "corrected reference geometry"
        );
        rectified
    }
}

impl Default for GeometryRectifier {
    fn default() -> Self {
        Self::new(30.0, 21.0, 0.15)
    }
}

fn valid_corners(set: &KeypointSet) -> Option<[(f64, f64); 4]> {
    let mut out = [(0.0, 0.0); 4];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = set.valid(i)?.position();
    }
    Some(out)
}
