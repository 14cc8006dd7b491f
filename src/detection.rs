//! Detection records delivered by the vision model.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Confidence above which a keypoint counts as observed.
pub const VALID_CONFIDENCE: f64 = 0.5;

/// A labeled image-space point with detection confidence.
///
/// Serialized as a `[x, y, confidence]` triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 3]", into = "[f64; 3]")]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    pub confidence: f64,
}

impl Keypoint {
    pub fn new(x: f64, y: f64, confidence: f64) -> Self {
        Self { x, y, confidence }
    }

    /// True when the confidence is strictly above [`VALID_CONFIDENCE`].
    pub fn is_valid(&self) -> bool {
        self.confidence > VALID_CONFIDENCE
    }

    pub fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }
}

impl From<[f64; 3]> for Keypoint {
    fn from([x, y, confidence]: [f64; 3]) -> Self {
        Self { x, y, confidence }
    }
}

impl From<Keypoint> for [f64; 3] {
    fn from(kp: Keypoint) -> Self {
        [kp.x, kp.y, kp.confidence]
    }
}

/// Ordered keypoints of one detected object instance.
///
/// Order is meaningful: for the reference frame index 0..4 are the corners
/// A, B, C, D.
#[derive(Debug, Clone, PartialEq)]
pub struct KeypointSet {
    /// Class label of the object the points belong to.
    pub label: String,

    /// Point coordinates (n_points x 2).
    pub points: DMatrix<f64>,

    /// Per-point confidence scores.
    pub scores: Vec<f64>,
}

impl KeypointSet {
    /// Create a keypoint set from a coordinate matrix and matching scores.
    ///
    /// # Arguments
    /// * `label` - Object class label
    /// * `points` - Point coordinates (n_points x 2)
    /// * `scores` - One confidence per point
    pub fn new(label: impl Into<String>, points: DMatrix<f64>, scores: Vec<f64>) -> Result<Self> {
        if points.ncols() != 2 {
            return Err(Error::InvalidKeypoints(format!(
                "expected n_points x 2 coordinates, got shape ({}, {})",
                points.nrows(),
                points.ncols()
            )));
        }
        if scores.len() != points.nrows() {
            return Err(Error::InvalidKeypoints(format!(
                "{} scores for {} points",
                scores.len(),
                points.nrows()
            )));
        }
        if points.iter().chain(scores.iter()).any(|v| !v.is_finite()) {
            return Err(Error::InvalidKeypoints("non-finite coordinate or score".to_string()));
        }

        Ok(Self {
            label: label.into(),
            points,
            scores,
        })
    }

    /// Build a keypoint set from a slice of keypoints.
    pub fn from_keypoints(label: impl Into<String>, keypoints: &[Keypoint]) -> Result<Self> {
        let flat: Vec<f64> = keypoints.iter().flat_map(|kp| [kp.x, kp.y]).collect();
        let points = DMatrix::from_row_slice(keypoints.len(), 2, &flat);
        let scores = keypoints.iter().map(|kp| kp.confidence).collect();
        Self::new(label, points, scores)
    }

    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    /// Keypoint at `index`, if present.
    pub fn get(&self, index: usize) -> Option<Keypoint> {
        (index < self.len()).then(|| {
            Keypoint::new(self.points[(index, 0)], self.points[(index, 1)], self.scores[index])
        })
    }

    /// Keypoint at `index` only when it is present and valid.
    pub fn valid(&self, index: usize) -> Option<Keypoint> {
        self.get(index).filter(Keypoint::is_valid)
    }

    /// Number of points with confidence above the validity threshold.
    pub fn valid_count(&self) -> usize {
        self.scores.iter().filter(|&&s| s > VALID_CONFIDENCE).count()
    }

    pub fn keypoints(&self) -> Vec<Keypoint> {
        (0..self.len()).filter_map(|i| self.get(i)).collect()
    }
}

/// One detection produced by the vision model for the current frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub class_name: String,

    /// Bounding box `[x1, y1, x2, y2]` in pixels.
    pub bbox: [f64; 4],

    #[serde(default)]
    pub confidence: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<Vec<Keypoint>>,
}

impl DetectionRecord {
    pub fn new(class_name: impl Into<String>, bbox: [f64; 4], confidence: f64) -> Self {
        Self {
            class_name: class_name.into(),
            bbox,
            confidence,
            keypoints: None,
        }
    }

    pub fn with_keypoints(mut self, keypoints: Vec<Keypoint>) -> Self {
        self.keypoints = Some(keypoints);
        self
    }

    /// Midpoint of the top edge of the bounding box.
    pub fn top_midpoint(&self) -> (f64, f64) {
        let [x1, y1, x2, _] = self.bbox;
        ((x1 + x2) / 2.0, y1)
    }

    /// Keypoints as a [`KeypointSet`] labeled with the class name.
    pub fn keypoint_set(&self) -> Option<KeypointSet> {
        let keypoints = self.keypoints.as_ref()?;
        KeypointSet::from_keypoints(self.class_name.clone(), keypoints).ok()
    }
}

/// First detection of `class_name` that carries keypoints.
pub fn find_with_keypoints<'a>(detections: &'a [DetectionRecord], class_name: &str) -> Option<&'a DetectionRecord> {
    detections
        .iter()
        .find(|d| d.class_name == class_name && d.keypoints.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_keypoint_validity_threshold() {
        assert!(Keypoint::new(0.0, 0.0, 0.51).is_valid());
        assert!(!Keypoint::new(0.0, 0.0, 0.5).is_valid());
        assert!(!Keypoint::new(0.0, 0.0, 0.0).is_valid());
    }

    #[test]
    fn test_detection_record_from_json() {
        let json = r#"{
            "class_name": "reference-frame",
            "bbox": [10.0, 20.0, 110.0, 90.0],
            "confidence": 0.92,
            "keypoints": [[10.0, 20.0, 0.9], [10.0, 90.0, 0.8]]
        }"#;
        let record: DetectionRecord = serde_json::from_str(json).unwrap();

        assert_eq!(record.class_name, "reference-frame");
        let keypoints = record.keypoints.as_ref().unwrap();
        assert_eq!(keypoints.len(), 2);
        assert_relative_eq!(keypoints[1].y, 90.0);
        assert_relative_eq!(keypoints[1].confidence, 0.8);
    }

    #[test]
    fn test_detection_record_without_keypoints() {
        let json = r#"{"class_name": "marker", "bbox": [0, 0, 4, 4]}"#;
        let record: DetectionRecord = serde_json::from_str(json).unwrap();

        assert!(record.keypoints.is_none());
        assert!(record.keypoint_set().is_none());
        assert_eq!(record.top_midpoint(), (2.0, 0.0));
    }

    #[test]
    fn test_keypoint_set_shape_validation() {
        let points = DMatrix::from_row_slice(2, 3, &[0.0; 6]);
        assert!(KeypointSet::new("x", points, vec![1.0, 1.0]).is_err());

        let points = DMatrix::from_row_slice(2, 2, &[0.0; 4]);
        assert!(KeypointSet::new("x", points, vec![1.0]).is_err());

        let points = DMatrix::from_row_slice(1, 2, &[f64::NAN, 0.0]);
        assert!(KeypointSet::new("x", points, vec![1.0]).is_err());
    }

    #[test]
    fn test_keypoint_set_accessors() {
        let set = KeypointSet::from_keypoints(
            "reference-frame",
            &[Keypoint::new(1.0, 2.0, 0.9), Keypoint::new(3.0, 4.0, 0.2)],
        )
        .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.valid_count(), 1);
        assert_eq!(set.get(1), Some(Keypoint::new(3.0, 4.0, 0.2)));
        assert_eq!(set.valid(1), None);
        assert_eq!(set.get(2), None);
        assert_eq!(set.keypoints().len(), 2);
    }

    #[test]
    fn test_find_with_keypoints_skips_bare_records() {
        let detections = vec![
            DetectionRecord::new("marker", [0.0, 0.0, 1.0, 1.0], 0.9),
            DetectionRecord::new("marker", [5.0, 5.0, 6.0, 6.0], 0.8)
                .with_keypoints(vec![Keypoint::new(5.5, 5.5, 0.9)]),
        ];

        let found = find_with_keypoints(&detections, "marker").unwrap();
        assert_eq!(found.bbox[0], 5.0);
        assert!(find_with_keypoints(&detections, "moving-part").is_none());
    }
}
