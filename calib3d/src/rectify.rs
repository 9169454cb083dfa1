//! Bouguet stereo rectification.
//!
//! Splits the relative rotation evenly between the two cameras, then turns
//! both so the baseline lies along the image x axis (y for vertical rigs).
//! Corresponding points of the rectified pair share a row.

use cv_core::{rodrigues_to_rotation_matrix, rotation_matrix_to_rodrigues, CameraModel};
use image::GrayImage;
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Point2, Point3, Vector2, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::distortion::{init_undistort_rectify_map, remap, undistorted_bounds, RemapTable, Roi};
use crate::stereo::StereoPose;
use crate::{CalibError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RectifyOptions {
    /// Free scaling in `[0, 1]`: 0 keeps only valid pixels, 1 keeps every
    /// source pixel. `None` leaves the focal length unscaled.
    pub alpha: Option<f64>,
    /// Size of the rectified images; the source size when `None`.
    pub new_image_size: Option<(u32, u32)>,
}

/// Rectifying rotations, projections, the disparity-to-depth matrix and the
/// remap tables of both cameras.
#[derive(Debug, Clone)]
pub struct RectificationSet {
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    pub p1: Matrix3x4<f64>,
    pub p2: Matrix3x4<f64>,
    pub q: Matrix4<f64>,
    /// Size of the source images.
    pub source_size: (u32, u32),
    /// Size of the rectified images.
    pub image_size: (u32, u32),
    pub left_map: RemapTable,
    pub right_map: RemapTable,
    pub roi_left: Roi,
    pub roi_right: Roi,
}

impl RectificationSet {
    /// Whether the baseline runs along the image y axis.
    pub fn is_vertical(&self) -> bool {
        self.p2[(1, 3)].abs() > self.p2[(0, 3)].abs()
    }

    /// Left rectified coordinates of pixel `(x, y)` with disparity `d`.
    pub fn reproject(&self, x: f64, y: f64, disparity: f64) -> Option<Point3<f64>> {
        let h = self.q * Vector4::new(x, y, disparity, 1.0);
        if h[3].abs() <= f64::EPSILON {
            return None;
        }
        Some(Point3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
    }

    /// Rectified pixel of a distorted source pixel of the left camera.
    pub fn rectify_left_point(&self, model: &CameraModel, pixel: &Point2<f64>) -> Point2<f64> {
        rectify_point(model, &self.r1, &self.p1, pixel)
    }

    /// Rectified pixel of a distorted source pixel of the right camera.
    pub fn rectify_right_point(&self, model: &CameraModel, pixel: &Point2<f64>) -> Point2<f64> {
        rectify_point(model, &self.r2, &self.p2, pixel)
    }
}

fn rectify_point(
    model: &CameraModel,
    rotation: &Matrix3<f64>,
    projection: &Matrix3x4<f64>,
    pixel: &Point2<f64>,
) -> Point2<f64> {
    let n = model.undistort_pixel(pixel);
    let v = projection.fixed_view::<3, 3>(0, 0) * (rotation * Vector3::new(n.x, n.y, 1.0));
    Point2::new(v[0] / v[2], v[1] / v[2])
}

/// Compute rectification for a calibrated rig with default options.
pub fn rectify(left: &CameraModel, right: &CameraModel, pose: &StereoPose) -> Result<RectificationSet> {
    rectify_with_options(left, right, pose, &RectifyOptions::default())
}

pub fn rectify_with_options(
    left: &CameraModel,
    right: &CameraModel,
    pose: &StereoPose,
    options: &RectifyOptions,
) -> Result<RectificationSet> {
    let source_size = left.intrinsics.image_size();
    if right.intrinsics.image_size() != source_size {
        return Err(CalibError::InvalidParameters(format!(
            "left and right images differ in size: {:?} vs {:?}",
            source_size,
            right.intrinsics.image_size()
        )));
    }
    if let Some(alpha) = options.alpha {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(CalibError::InvalidParameters(format!(
                "alpha must lie in [0, 1], got {alpha}"
            )));
        }
    }
    let image_size = options.new_image_size.unwrap_or(source_size);
    if image_size.0 == 0 || image_size.1 == 0 {
        return Err(CalibError::InvalidParameters(
            "rectified image size must be non-zero".to_string(),
        ));
    }
    let baseline = pose.translation.norm();
    if baseline <= 1e-12 {
        return Err(CalibError::InvalidParameters(
            "rectification requires a non-zero baseline".to_string(),
        ));
    }

    // Half rotations, then align the baseline with the dominant image axis.
    let om = rotation_matrix_to_rodrigues(&pose.rotation);
    let r_r = rodrigues_to_rotation_matrix(&(om * -0.5));
    let t = r_r * pose.translation;
    let idx = if t.x.abs() > t.y.abs() { 0 } else { 1 };
    let c = t[idx];
    let mut uu = Vector3::zeros();
    uu[idx] = if c > 0.0 { 1.0 } else { -1.0 };
    let mut ww = t.cross(&uu);
    let nw = ww.norm();
    if nw > 0.0 {
        ww *= (c.abs() / baseline).clamp(-1.0, 1.0).acos() / nw;
    }
    let w_r = rodrigues_to_rotation_matrix(&ww);
    let r1 = w_r * r_r.transpose();
    let r2 = w_r * r_r;
    let t_rect = r2 * pose.translation;

    // Common focal length, corrected for radial distortion at the image corner.
    let (w, h) = (source_size.0 as f64, source_size.1 as f64);
    let mut fc = f64::MAX;
    for model in [left, right] {
        let k = &model.intrinsics;
        let mut f = if idx == 0 { k.fy } else { k.fx };
        let k1 = model.distortion.k1;
        if k1 != 0.0 {
            f *= 1.0 + k1 * (w * w + h * h) / (4.0 * f * f);
        }
        fc = fc.min(f);
    }

    // Principal points that centre the undistorted image corners, shared so
    // that points at infinity have zero disparity.
    let corners = [
        Point2::new(0.0, 0.0),
        Point2::new(w - 1.0, 0.0),
        Point2::new(w - 1.0, h - 1.0),
        Point2::new(0.0, h - 1.0),
    ];
    let mut cc = Vector2::zeros();
    for (model, r) in [(left, &r1), (right, &r2)] {
        let mut mean = Vector2::zeros();
        for p in &corners {
            let n = model.undistort_pixel(p);
            let v = r * Vector3::new(n.x, n.y, 1.0);
            mean += Vector2::new(fc * v[0] / v[2], fc * v[1] / v[2]);
        }
        mean /= corners.len() as f64;
        cc += Vector2::new((w - 1.0) / 2.0, (h - 1.0) / 2.0) - mean;
    }
    cc /= 2.0;

    // Rescale into the requested output size and apply the free scaling.
    let cc_0 = cc;
    let cc = Vector2::new(
        image_size.0 as f64 * cc_0.x / w,
        image_size.1 as f64 * cc_0.y / h,
    );
    let k_0 = camera(fc, cc_0);
    let mut scale = 1.0;
    if let Some(alpha) = options.alpha {
        let (new_w, new_h) = (image_size.0 as f64, image_size.1 as f64);
        let mut s0: f64 = 0.0;
        let mut s1 = f64::MAX;
        for (model, r) in [(left, &r1), (right, &r2)] {
            let (inner, outer) = undistorted_bounds(model, r, Some(&k_0));
            s0 = s0
                .max(cc.x / (cc_0.x - inner.min_x))
                .max(cc.y / (cc_0.y - inner.min_y))
                .max((new_w - cc.x) / (inner.max_x - cc_0.x))
                .max((new_h - cc.y) / (inner.max_y - cc_0.y));
            s1 = s1
                .min(cc.x / (cc_0.x - outer.min_x))
                .min(cc.y / (cc_0.y - outer.min_y))
                .min((new_w - cc.x) / (outer.max_x - cc_0.x))
                .min((new_h - cc.y) / (outer.max_y - cc_0.y));
        }
        scale = s0 * (1.0 - alpha) + s1 * alpha;
        if !(scale.is_finite() && scale > 0.0) {
            return Err(CalibError::InvalidParameters(format!(
                "free scaling produced an invalid scale {scale}"
            )));
        }
    }
    let f = fc * scale;
    let k_new = camera(f, cc);

    let mut p1 = Matrix3x4::zeros();
    p1.fixed_view_mut::<3, 3>(0, 0).copy_from(&k_new);
    let mut p2 = p1;
    p2[(idx, 3)] = t_rect[idx] * f;

    let mut q = Matrix4::zeros();
    q[(0, 0)] = 1.0;
    q[(0, 3)] = -cc.x;
    q[(1, 1)] = 1.0;
    q[(1, 3)] = -cc.y;
    q[(2, 3)] = f;
    // Shared principal points leave q[(3, 3)] = (cx1 - cx2) / tx at zero.
    q[(3, 2)] = -1.0 / t_rect[idx];

    let (left_map, right_map) = rayon::join(
        || init_undistort_rectify_map(left, &r1, &k_new, image_size),
        || init_undistort_rectify_map(right, &r2, &k_new, image_size),
    );
    let roi_left = undistorted_bounds(left, &r1, Some(&k_new)).0.to_roi(image_size);
    let roi_right = undistorted_bounds(right, &r2, Some(&k_new)).0.to_roi(image_size);
    debug!(?roi_left, ?roi_right, scale, "rectified valid regions");
    info!(
        focal = f,
        cx = cc.x,
        cy = cc.y,
        vertical = idx == 1,
        "stereo rectification computed"
    );

    Ok(RectificationSet {
        r1,
        r2,
        p1,
        p2,
        q,
        source_size,
        image_size,
        left_map: left_map?,
        right_map: right_map?,
        roi_left,
        roi_right,
    })
}

fn camera(f: f64, cc: Vector2<f64>) -> Matrix3<f64> {
    Matrix3::new(f, 0.0, cc.x, 0.0, f, cc.y, 0.0, 0.0, 1.0)
}

/// Rectify a synchronized image pair through the tables of `set`.
pub fn rectify_pair(
    left: &GrayImage,
    right: &GrayImage,
    set: &RectificationSet,
) -> Result<(GrayImage, GrayImage)> {
    for (side, img) in [("left", left), ("right", right)] {
        if img.dimensions() != set.source_size {
            return Err(CalibError::InvalidParameters(format!(
                "{side} image is {}x{}, rectification expects {}x{}",
                img.width(),
                img.height(),
                set.source_size.0,
                set.source_size.1
            )));
        }
    }
    Ok(rayon::join(
        || remap(left, &set.left_map, 0),
        || remap(right, &set.right_map, 0),
    ))
}
