//! Distortion correction functions for camera calibration
//!
//! Point and image undistortion for the Brown–Conrady model, remap table
//! generation with an optional rectifying rotation, and the optimal new
//! camera matrix for a given free-scaling parameter.

use crate::{CalibError, Result};
use cv_core::{CameraIntrinsics, CameraModel};
use image::GrayImage;
use nalgebra::{Matrix3, Point2, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-pixel source coordinates: destination pixel `(x, y)` samples the source
/// image at `(map_x[i], map_y[i])` with `i = y * width + x`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemapTable {
    pub width: u32,
    pub height: u32,
    pub map_x: Vec<f32>,
    pub map_y: Vec<f32>,
}

impl RemapTable {
    pub fn at(&self, x: u32, y: u32) -> (f32, f32) {
        let i = (y * self.width + x) as usize;
        (self.map_x[i], self.map_y[i])
    }
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Extent of a set of undistorted border samples.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Whole pixels inside the bounds, clipped to the image.
    pub fn to_roi(self, image_size: (u32, u32)) -> Roi {
        let (w, h) = (image_size.0 as f64, image_size.1 as f64);
        let x0 = self.min_x.ceil().max(0.0);
        let y0 = self.min_y.ceil().max(0.0);
        let x1 = self.max_x.floor().min(w - 1.0);
        let y1 = self.max_y.floor().min(h - 1.0);
        if x1 < x0 || y1 < y0 {
            return Roi::default();
        }
        Roi {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0 + 1.0) as u32,
            height: (y1 - y0 + 1.0) as u32,
        }
    }
}

/// Inner and outer bounds of the image border after undistortion and `rotation`.
///
/// Coordinates are normalized, or pixels of `new_camera` when given. The inner
/// bounds only contain valid source pixels; the outer bounds contain them all.
pub(crate) fn undistorted_bounds(
    model: &CameraModel,
    rotation: &Matrix3<f64>,
    new_camera: Option<&Matrix3<f64>>,
) -> (Bounds, Bounds) {
    const N: usize = 9;
    let (w, h) = model.intrinsics.image_size();
    let mut grid = [[Point2::origin(); N]; N];
    for (i, row) in grid.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            let px = Point2::new(
                j as f64 * (w as f64 - 1.0) / (N - 1) as f64,
                i as f64 * (h as f64 - 1.0) / (N - 1) as f64,
            );
            let n = model.undistort_pixel(&px);
            let mut v = rotation * Vector3::new(n.x, n.y, 1.0);
            if let Some(k) = new_camera {
                v = k * v;
            }
            *cell = Point2::new(v[0] / v[2], v[1] / v[2]);
        }
    }

    let mut outer = Bounds {
        min_x: f64::MAX,
        min_y: f64::MAX,
        max_x: f64::MIN,
        max_y: f64::MIN,
    };
    let mut inner = Bounds {
        min_x: f64::MIN,
        min_y: f64::MIN,
        max_x: f64::MAX,
        max_y: f64::MAX,
    };
    for (i, row) in grid.iter().enumerate() {
        for (j, p) in row.iter().enumerate() {
            outer.min_x = outer.min_x.min(p.x);
            outer.min_y = outer.min_y.min(p.y);
            outer.max_x = outer.max_x.max(p.x);
            outer.max_y = outer.max_y.max(p.y);
            if j == 0 {
                inner.min_x = inner.min_x.max(p.x);
            }
            if j == N - 1 {
                inner.max_x = inner.max_x.min(p.x);
            }
            if i == 0 {
                inner.min_y = inner.min_y.max(p.y);
            }
            if i == N - 1 {
                inner.max_y = inner.max_y.min(p.y);
            }
        }
    }
    (inner, outer)
}

/// Undistort pixel coordinates. The result is expressed in `new_intrinsics`
/// (the model's own intrinsics when `None`).
pub fn undistort_points(
    distorted_points: &[Point2<f64>],
    model: &CameraModel,
    new_intrinsics: Option<&CameraIntrinsics>,
) -> Result<Vec<Point2<f64>>> {
    if !model.intrinsics.is_valid() {
        return Err(CalibError::InvalidParameters(
            "undistort_points requires non-zero focal lengths".to_string(),
        ));
    }
    let k_new = new_intrinsics.unwrap_or(&model.intrinsics);
    Ok(distorted_points
        .iter()
        .map(|p| k_new.normalized_to_pixel(&model.undistort_pixel(p)))
        .collect())
}

/// Inverse of [`undistort_points`] for a single ideal pinhole pixel of the model's intrinsics.
pub fn distort_point(model: &CameraModel, undistorted: &Point2<f64>) -> Point2<f64> {
    let n = model.intrinsics.pixel_to_normalized(undistorted);
    let (xd, yd) = model.distortion.apply(n.x, n.y);
    model.intrinsics.normalized_to_pixel(&Point2::new(xd, yd))
}

/// Create remap tables for undistortion with optional rectification.
///
/// Destination pixels live in the camera `new_camera` after `rectification`;
/// each entry points back at the distorted source pixel.
pub fn init_undistort_rectify_map(
    model: &CameraModel,
    rectification: &Matrix3<f64>,
    new_camera: &Matrix3<f64>,
    image_size: (u32, u32),
) -> Result<RemapTable> {
    if image_size.0 == 0 || image_size.1 == 0 {
        return Err(CalibError::InvalidParameters(
            "init_undistort_rectify_map requires non-zero image size".to_string(),
        ));
    }
    let inv = (new_camera * rectification).try_inverse().ok_or_else(|| {
        CalibError::InvalidParameters("new camera matrix times rectification is singular".to_string())
    })?;

    let (width, height) = image_size;
    let mut map_x = vec![0.0f32; (width * height) as usize];
    let mut map_y = vec![0.0f32; (width * height) as usize];
    let k = &model.intrinsics;
    let d = &model.distortion;

    map_x
        .par_chunks_mut(width as usize)
        .zip(map_y.par_chunks_mut(width as usize))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| {
            for x in 0..width as usize {
                let ray = inv * Vector3::new(x as f64, y as f64, 1.0);
                if ray[2].abs() <= 1e-12 {
                    row_x[x] = -1.0;
                    row_y[x] = -1.0;
                    continue;
                }
                let (xd, yd) = d.apply(ray[0] / ray[2], ray[1] / ray[2]);
                row_x[x] = (k.fx * xd + k.cx) as f32;
                row_y[x] = (k.fy * yd + k.cy) as f32;
            }
        });

    Ok(RemapTable {
        width,
        height,
        map_x,
        map_y,
    })
}

/// Samples this close outside the source still count as on its edge.
const EDGE_SLACK: f32 = 1e-3;

/// Bilinear resampling of `src` through `table`. Samples falling outside the
/// source take the value `border`.
pub fn remap(src: &GrayImage, table: &RemapTable, border: u8) -> GrayImage {
    let (sw, sh) = src.dimensions();
    let mut out = GrayImage::new(table.width, table.height);
    if table.width == 0 {
        return out;
    }
    let raw = src.as_raw();
    let max_x = sw as f32 - 1.0;
    let max_y = sh as f32 - 1.0;

    out.par_chunks_mut(table.width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let base = y * table.width as usize;
            for (x, px) in row.iter_mut().enumerate() {
                let sx = table.map_x[base + x];
                let sy = table.map_y[base + x];
                if !(sx >= -EDGE_SLACK && sy >= -EDGE_SLACK && sx <= max_x + EDGE_SLACK && sy <= max_y + EDGE_SLACK) {
                    *px = border;
                    continue;
                }
                let (sx, sy) = (sx.clamp(0.0, max_x), sy.clamp(0.0, max_y));
                let x0 = sx.floor() as usize;
                let y0 = sy.floor() as usize;
                let x1 = (x0 + 1).min(sw as usize - 1);
                let y1 = (y0 + 1).min(sh as usize - 1);
                let fx = sx - x0 as f32;
                let fy = sy - y0 as f32;
                let at = |xx: usize, yy: usize| raw[yy * sw as usize + xx] as f32;
                let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
                let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
                *px = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
            }
        });
    out
}

/// Undistort a grayscale image using the camera model.
pub fn undistort_image(
    src: &GrayImage,
    model: &CameraModel,
    new_intrinsics: Option<&CameraIntrinsics>,
) -> Result<GrayImage> {
    let k_new = new_intrinsics.unwrap_or(&model.intrinsics);
    let table = init_undistort_rectify_map(
        model,
        &Matrix3::identity(),
        &k_new.matrix(),
        (src.width(), src.height()),
    )?;
    Ok(remap(src, &table, 0))
}

/// Camera matrix for undistorted images of `new_size` (the model's size by default).
///
/// `alpha = 0` keeps only valid pixels, `alpha = 1` keeps every source pixel;
/// values in between interpolate. The returned ROI is the all-valid region.
pub fn optimal_new_camera_matrix(
    model: &CameraModel,
    alpha: f64,
    new_size: Option<(u32, u32)>,
) -> Result<(CameraIntrinsics, Roi)> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(CalibError::InvalidParameters(format!(
            "alpha must lie in [0, 1], got {alpha}"
        )));
    }
    if !model.intrinsics.is_valid() {
        return Err(CalibError::InvalidParameters(
            "optimal_new_camera_matrix requires a valid camera matrix".to_string(),
        ));
    }
    let size = new_size.unwrap_or_else(|| model.intrinsics.image_size());
    let (w, h) = (size.0 as f64, size.1 as f64);
    let (inner, outer) = undistorted_bounds(model, &Matrix3::identity(), None);
    if inner.width() <= 0.0 || inner.height() <= 0.0 {
        return Err(CalibError::InvalidParameters(
            "distortion leaves no valid image region".to_string(),
        ));
    }

    let fit = |b: &Bounds| {
        let fx = (w - 1.0) / b.width();
        let fy = (h - 1.0) / b.height();
        (fx, fy, -fx * b.min_x, -fy * b.min_y)
    };
    let (fx0, fy0, cx0, cy0) = fit(&inner);
    let (fx1, fy1, cx1, cy1) = fit(&outer);
    let lerp = |a: f64, b: f64| a * (1.0 - alpha) + b * alpha;
    let k = CameraIntrinsics::new(
        lerp(fx0, fx1),
        lerp(fy0, fy1),
        lerp(cx0, cx1),
        lerp(cy0, cy1),
        size.0,
        size.1,
    );

    let (valid, _) = undistorted_bounds(model, &Matrix3::identity(), Some(&k.matrix()));
    Ok((k, valid.to_roi(size)))
}

/// Copies the `roi` region out of `image`.
pub fn crop_to_roi(image: &GrayImage, roi: &Roi) -> Result<GrayImage> {
    if roi.is_empty()
        || roi.x + roi.width > image.width()
        || roi.y + roi.height > image.height()
    {
        return Err(CalibError::InvalidParameters(format!(
            "roi {roi:?} does not fit a {}x{} image",
            image.width(),
            image.height()
        )));
    }
    Ok(image::imageops::crop_imm(image, roi.x, roi.y, roi.width, roi.height).to_image())
}
