//! Locating the two measurement points in a frame's detections.

use crate::detection::{find_with_keypoints, DetectionRecord, Keypoint};
use crate::filter::KeypointStabilizer;
use crate::geometry::{GeometryRectifier, CORNER_D};

/// Number of leading moving-part keypoints that form its cluster.
const CLUSTER_SIZE: usize = 4;
/// Valid cluster points needed for a centroid.
const MIN_CLUSTER_POINTS: usize = 2;

/// Confidence-weighted centroid of the moving part's stabilized keypoints.
pub(crate) fn target_centroid(
    detections: &[DetectionRecord],
    label: &str,
    stabilizer: &mut KeypointStabilizer,
) -> Option<(f64, f64)> {
    let keypoints = find_with_keypoints(detections, label)?.keypoints.as_deref()?;
    if keypoints.len() < CLUSTER_SIZE {
        return None;
    }

    let stabilized: Vec<(f64, f64, f64)> = keypoints[..CLUSTER_SIZE]
        .iter()
        .enumerate()
        .filter(|(_, kp)| kp.is_valid())
        .map(|(i, kp)| {
            let (x, y) = stabilizer.stabilize(&format!("{}_{}", label, i), kp);
            (x, y, kp.confidence)
        })
        .collect();

    if stabilized.len() < MIN_CLUSTER_POINTS {
        return None;
    }

    let total: f64 = stabilized.iter().map(|p| p.2).sum();
    if total <= 0.0 {
        return None;
    }
    Some((
        stabilized.iter().map(|p| p.0 * p.2).sum::<f64>() / total,
        stabilized.iter().map(|p| p.1 * p.2).sum::<f64>() / total,
    ))
}

/// Corner D of the rectified reference frame, stabilized.
pub(crate) fn reference_corner(
    detections: &[DetectionRecord],
    label: &str,
    rectifier: &GeometryRectifier,
    stabilizer: &mut KeypointStabilizer,
) -> Option<(f64, f64)> {
    let corners = find_with_keypoints(detections, label)?.keypoint_set()?;
    if corners.len() < 4 {
        return None;
    }

    let corner = rectifier.rectify(&corners).valid(CORNER_D)?;
    Some(stabilizer.stabilize(&format!("{}_d", label), &corner))
}

/// Top-edge midpoint of the marker box and the stabilized center of its
/// valid keypoints.
pub(crate) fn marker_points(
    detections: &[DetectionRecord],
    label: &str,
    stabilizer: &mut KeypointStabilizer,
) -> Option<((f64, f64), (f64, f64))> {
    let top = detections.iter().find(|d| d.class_name == label)?.top_midpoint();

    let keypoints = find_with_keypoints(detections, label)?.keypoints.as_deref()?;
    let valid: Vec<&Keypoint> = keypoints.iter().filter(|kp| kp.is_valid()).collect();
    if valid.is_empty() {
        return None;
    }
    let n = valid.len() as f64;
    let center = (
        valid.iter().map(|kp| kp.x).sum::<f64>() / n,
        valid.iter().map(|kp| kp.y).sum::<f64>() / n,
    );

    Some((top, stabilizer.stabilize_point(&format!("{}_center", label), center)))
}
