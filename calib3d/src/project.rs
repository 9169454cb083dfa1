//! Forward projection through the pinhole + Brown–Conrady camera model.

use cv_core::{CameraIntrinsics, CameraModel, Distortion, Pose};
use nalgebra::{Point2, Point3};
use rayon::prelude::*;

use crate::observation::Observation;
use crate::{CalibError, Result};

/// Number of intrinsic parameters in the solver layout
/// `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
pub const INTRINSIC_PARAMS: usize = 9;

/// Number of parameters of one pose, `[rx, ry, rz, tx, ty, tz]`.
pub const POSE_PARAMS: usize = 6;

/// Project board points seen under `pose` into pixel coordinates.
///
/// # Errors
/// Returns `InvalidParameters` if any point is non-finite or not in front of the camera.
pub fn project_points(
    object_points: &[Point3<f64>],
    model: &CameraModel,
    pose: &Pose,
) -> Result<Vec<Point2<f64>>> {
    object_points
        .par_iter()
        .map(|p| {
            model
                .project_with_pose(pose, p)
                .filter(|px| px.x.is_finite() && px.y.is_finite())
                .ok_or_else(|| {
                    CalibError::InvalidParameters(format!(
                        "point ({:.3}, {:.3}, {:.3}) does not project in front of the camera",
                        p.x, p.y, p.z
                    ))
                })
        })
        .collect()
}

/// Pixel distance between every observed corner and its reprojection.
/// Points that fail to project get an infinite error.
pub fn reprojection_distances(model: &CameraModel, pose: &Pose, obs: &Observation) -> Vec<f64> {
    obs.world_points()
        .iter()
        .zip(obs.image_points())
        .map(|(w, m)| match model.project_with_pose(pose, w) {
            Some(p) => (p - m).norm(),
            None => f64::INFINITY,
        })
        .collect()
}

/// Writes `[du0, dv0, du1, dv1, ...]` (projection minus measurement) into `out`.
/// Unprojectable points produce NaN so callers can reject the parameters.
pub(crate) fn write_residuals(model: &CameraModel, pose: &Pose, obs: &Observation, out: &mut [f64]) {
    for (i, (w, m)) in obs.world_points().iter().zip(obs.image_points()).enumerate() {
        match model.project_with_pose(pose, w) {
            Some(p) => {
                out[2 * i] = p.x - m.x;
                out[2 * i + 1] = p.y - m.y;
            }
            None => {
                out[2 * i] = f64::NAN;
                out[2 * i + 1] = f64::NAN;
            }
        }
    }
}

pub(crate) fn intrinsic_params(model: &CameraModel) -> [f64; INTRINSIC_PARAMS] {
    let k = &model.intrinsics;
    let d = &model.distortion;
    [k.fx, k.fy, k.cx, k.cy, d.k1, d.k2, d.p1, d.p2, d.k3]
}

/// Rebuilds a camera model from the solver layout. With `aspect_ratio` set,
/// `fy` is derived as `fx / aspect_ratio` and the stored `fy` slot is ignored.
pub(crate) fn model_from_params(
    p: &[f64],
    image_size: (u32, u32),
    aspect_ratio: Option<f64>,
) -> CameraModel {
    let fy = match aspect_ratio {
        Some(ratio) => p[0] / ratio,
        None => p[1],
    };
    CameraModel::new(
        CameraIntrinsics::new(p[0], fy, p[2], p[3], image_size.0, image_size.1),
        Distortion::new(p[4], p[5], p[6], p[7], p[8]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn params_roundtrip_through_model() {
        let model = CameraModel::new(
            CameraIntrinsics::new(810.0, 805.0, 321.0, 239.0, 640, 480),
            Distortion::new(-0.1, 0.02, 0.001, -0.002, 0.003),
        );
        let back = model_from_params(&intrinsic_params(&model), (640, 480), None);
        assert_eq!(back, model);
    }

    #[test]
    fn aspect_ratio_overrides_fy() {
        let p = [800.0, 1.0, 320.0, 240.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let model = model_from_params(&p, (640, 480), Some(2.0));
        assert_eq!(model.intrinsics.fy, 400.0);
    }

    #[test]
    fn behind_camera_is_an_error() {
        let model = CameraModel::new(
            CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0, 640, 480),
            Distortion::none(),
        );
        let pose = Pose::new(nalgebra::Matrix3::identity(), Vector3::new(0.0, 0.0, -1.0));
        let pts = [Point3::new(0.0, 0.0, 0.0)];
        assert!(project_points(&pts, &model, &pose).is_err());
    }
}
