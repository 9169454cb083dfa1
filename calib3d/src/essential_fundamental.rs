use cv_core::{skew_symmetric, CameraIntrinsics};
use nalgebra::{Matrix3, Point2, Vector3};

/// Essential matrix of a relative pose `x_r = R x_l + t`: `E = [t]x R`.
pub fn essential_from_pose(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix3<f64> {
    skew_symmetric(translation) * rotation
}

/// Compute Fundamental matrix from Essential matrix using camera intrinsics.
///
/// F = K_right^-T * E * K_left^-1
pub fn fundamental_from_essential(
    essential: &Matrix3<f64>,
    left: &CameraIntrinsics,
    right: &CameraIntrinsics,
) -> Matrix3<f64> {
    let k_left_inv = left.inverse_matrix();
    let k_right_inv_t = right.inverse_matrix().transpose();
    k_right_inv_t * essential * k_left_inv
}

/// Distance in pixels from `right` to the epipolar line of `left` under `f`.
pub fn epipolar_distance(f: &Matrix3<f64>, left: &Point2<f64>, right: &Point2<f64>) -> f64 {
    let line = f * Vector3::new(left.x, left.y, 1.0);
    let norm = (line[0] * line[0] + line[1] * line[1]).sqrt();
    if norm <= f64::EPSILON {
        return f64::INFINITY;
    }
    (line[0] * right.x + line[1] * right.y + line[2]).abs() / norm
}
