//! Closed-form planar estimates: DLT homographies, Zhang's intrinsics and
//! board poses from homographies. These seed the nonlinear solvers.

use cv_core::{CameraIntrinsics, CameraModel, Pose};
use nalgebra::{DMatrix, Matrix3, Point2, Vector3};

use crate::observation::Observation;
use crate::{CalibError, Result};

/// Estimate homography using the normalized Direct Linear Transform.
pub fn estimate_homography_dlt(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < 4 {
        return Err(CalibError::InvalidParameters(
            "estimate_homography_dlt needs >=4 paired points".to_string(),
        ));
    }

    let (src_n, ts) = normalize_points_hartley(src)?;
    let (dst_n, td) = normalize_points_hartley(dst)?;
    let n = src.len();
    // At least 9 rows so the thin SVD still exposes the null vector for n = 4.
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);
    for i in 0..n {
        let x = src_n[i].x;
        let y = src_n[i].y;
        let u = dst_n[i].x;
        let v = dst_n[i].y;
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let vt = svd.v_t.ok_or_else(|| {
        CalibError::InvalidParameters("SVD failed in estimate_homography_dlt".to_string())
    })?;
    let smallest = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(8);
    let h = vt.row(smallest);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let td_inv = td.try_inverse().ok_or_else(|| {
        CalibError::InvalidParameters("degenerate point normalization".to_string())
    })?;
    let mut hdenorm = td_inv * hn * ts;
    if hdenorm[(2, 2)].abs() > 1e-12 {
        hdenorm /= hdenorm[(2, 2)];
    }
    if !hdenorm.iter().all(|v| v.is_finite()) {
        return Err(CalibError::InvalidParameters(
            "non-finite homography".to_string(),
        ));
    }
    Ok(hdenorm)
}

/// Homography mapping board (x, y) to pixels for one observation.
pub(crate) fn observation_homography(obs: &Observation) -> Result<Matrix3<f64>> {
    let board: Vec<Point2<f64>> = obs
        .world_points()
        .iter()
        .map(|p| Point2::new(p.x, p.y))
        .collect();
    estimate_homography_dlt(&board, obs.image_points())
}

/// Zhang's closed-form camera matrix from three or more plane homographies.
pub(crate) fn intrinsics_from_homographies(homographies: &[Matrix3<f64>]) -> Result<Matrix3<f64>> {
    if homographies.len() < 3 {
        return Err(CalibError::InsufficientObservations(
            "need at least 3 homographies for the closed-form camera matrix".to_string(),
        ));
    }

    let mut v = DMatrix::<f64>::zeros(2 * homographies.len(), 6);
    for (i, h) in homographies.iter().enumerate() {
        let v12 = v_ij(h, 0, 1);
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        for j in 0..6 {
            v[(2 * i, j)] = v12[j];
            v[(2 * i + 1, j)] = v11[j] - v22[j];
        }
    }

    let svd = v.svd(false, true);
    let vt = svd.v_t.ok_or_else(|| {
        CalibError::InvalidParameters("SVD failed in intrinsics_from_homographies".to_string())
    })?;
    let smallest = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(5);
    let b = vt.row(smallest);
    let mut bv = [b[0], b[1], b[2], b[3], b[4], b[5]];

    // Null-space sign is arbitrary; B must be positive definite.
    if bv[0] < 0.0 {
        bv.iter_mut().for_each(|x| *x = -*x);
    }
    let [b11, b12, b22, b13, b23, b33] = bv;
    let denom = b11 * b22 - b12 * b12;
    if denom.abs() < 1e-18 || b11.abs() < 1e-18 {
        return Err(CalibError::InvalidParameters(
            "degenerate calibration system".to_string(),
        ));
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda <= 0.0 || denom <= 0.0 {
        return Err(CalibError::InvalidParameters(
            "invalid lambda in planar calibration".to_string(),
        ));
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    let k = Matrix3::new(alpha, gamma, u0, 0.0, beta, v0, 0.0, 0.0, 1.0);
    if !k.iter().all(|x| x.is_finite()) {
        return Err(CalibError::InvalidParameters(
            "non-finite closed-form camera matrix".to_string(),
        ));
    }
    Ok(k)
}

/// Single focal length with the principal point held at `(cx, cy)`, from the
/// orthogonality constraints of each homography. Works from one view.
pub(crate) fn focal_from_homographies(homographies: &[Matrix3<f64>], cx: f64, cy: f64) -> Option<f64> {
    let shift = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);
    let mut num = 0.0;
    let mut den = 0.0;
    for h in homographies {
        let g = shift * h;
        // a * w + b = 0, with w = 1 / f^2
        let eqs = [
            (
                g[(0, 0)] * g[(0, 1)] + g[(1, 0)] * g[(1, 1)],
                g[(2, 0)] * g[(2, 1)],
            ),
            (
                g[(0, 0)].powi(2) + g[(1, 0)].powi(2) - g[(0, 1)].powi(2) - g[(1, 1)].powi(2),
                g[(2, 0)].powi(2) - g[(2, 1)].powi(2),
            ),
        ];
        for (a, b) in eqs {
            num -= a * b;
            den += a * a;
        }
    }
    if den <= 1e-30 {
        return None;
    }
    let w = num / den;
    if !(w.is_finite() && w > 0.0) {
        return None;
    }
    let f = 1.0 / w.sqrt();
    f.is_finite().then_some(f)
}

/// Board pose from a homography `H ~ K [r1 r2 t]`, with the board in front of the camera.
pub(crate) fn pose_from_homography(k_inv: &Matrix3<f64>, h: &Matrix3<f64>) -> Result<Pose> {
    let r1_raw = k_inv * h.column(0);
    let r2_raw = k_inv * h.column(1);
    let t_raw = k_inv * h.column(2);
    let norm = (r1_raw.norm() + r2_raw.norm()) / 2.0;
    if norm < 1e-18 {
        return Err(CalibError::InvalidParameters(
            "degenerate homography".to_string(),
        ));
    }
    let mut scale = 1.0 / norm;
    if t_raw[2] * scale < 0.0 {
        scale = -scale;
    }

    let r1: Vector3<f64> = r1_raw * scale;
    let r2: Vector3<f64> = r2_raw * scale;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);
    let r = cv_core::nearest_rotation(&r).ok_or_else(|| {
        CalibError::InvalidParameters("SVD failed in pose_from_homography".to_string())
    })?;
    Ok(Pose::new(r, t_raw * scale))
}

/// Board pose of one observation under a known camera model.
pub fn estimate_planar_pose(model: &CameraModel, obs: &Observation) -> Result<Pose> {
    let board: Vec<Point2<f64>> = obs
        .world_points()
        .iter()
        .map(|p| Point2::new(p.x, p.y))
        .collect();
    let normalized: Vec<Point2<f64>> = obs
        .image_points()
        .iter()
        .map(|p| model.undistort_pixel(p))
        .collect();
    let h = estimate_homography_dlt(&board, &normalized)?;
    pose_from_homography(&Matrix3::identity(), &h)
}

/// Initial camera matrix for `homographies`, falling back from Zhang's closed
/// form to a single focal length and finally to an ideal pinhole.
pub(crate) fn initial_intrinsics(
    homographies: &[Matrix3<f64>],
    image_size: (u32, u32),
) -> CameraIntrinsics {
    let (w, h) = image_size;
    let plausible = |k: &CameraIntrinsics| {
        k.is_valid()
            && k.cx > 0.0
            && k.cy > 0.0
            && k.cx < w as f64
            && k.cy < h as f64
            && k.fx / k.fy < 4.0
            && k.fy / k.fx < 4.0
    };

    if let Ok(k) = intrinsics_from_homographies(homographies) {
        let k = CameraIntrinsics::from_matrix(&k, w, h);
        if plausible(&k) {
            return k;
        }
    }
    let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
    if let Some(f) = focal_from_homographies(homographies, cx, cy) {
        let k = CameraIntrinsics::new(f, f, cx, cy, w, h);
        if plausible(&k) {
            return k;
        }
    }
    CameraIntrinsics::new_ideal(w, h)
}

/// Helper function to compute v_ij for intrinsic calibration
fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    [
        h[(0, i)] * h[(0, j)],
        h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
        h[(1, i)] * h[(1, j)],
        h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
        h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
        h[(2, i)] * h[(2, j)],
    ]
}

/// Normalize points using Hartley normalization
fn normalize_points_hartley(points: &[Point2<f64>]) -> Result<(Vec<Point2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return Err(CalibError::InvalidParameters(
            "normalize_points_hartley: empty points array".to_string(),
        ));
    }

    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / points.len() as f64;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / points.len() as f64;

    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mean_x).powi(2) + (p.y - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / points.len() as f64;

    let scale = if mean_dist.abs() > 1e-18 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let normalized = points
        .iter()
        .map(|p| Point2::new((p.x - mean_x) * scale, (p.y - mean_y) * scale))
        .collect();

    let t = Matrix3::new(
        scale,
        0.0,
        -mean_x * scale,
        0.0,
        scale,
        -mean_y * scale,
        0.0,
        0.0,
        1.0,
    );

    Ok((normalized, t))
}
