//! Chessboard images: printable targets and synthetic camera views.

use cv_core::{CameraModel, Pose};
use image::{GrayImage, Luma};
use nalgebra::{Point2, Vector3};
use rayon::prelude::*;

use crate::pattern::CalibrationPattern;
use crate::{CalibError, Result};

const DARK: u8 = 20;
const LIGHT: u8 = 230;

/// Printable board with `(cols + 1) x (rows + 1)` squares of `square_px`
/// pixels, surrounded by a white border. The top-left square is black.
pub fn render_chessboard(pattern: &CalibrationPattern, square_px: u32, border_px: u32) -> Result<GrayImage> {
    if square_px < 2 {
        return Err(CalibError::InvalidParameters(format!(
            "squares must be at least 2 px, got {square_px}"
        )));
    }
    let squares_x = pattern.cols() as u32 + 1;
    let squares_y = pattern.rows() as u32 + 1;
    let width = squares_x * square_px + 2 * border_px;
    let height = squares_y * square_px + 2 * border_px;

    Ok(GrayImage::from_fn(width, height, |x, y| {
        if x < border_px || y < border_px || x >= width - border_px || y >= height - border_px {
            return Luma([255]);
        }
        let i = (x - border_px) / square_px;
        let j = (y - border_px) / square_px;
        Luma([if (i + j) % 2 == 0 { 0 } else { 255 }])
    }))
}

/// Interior corner pixels of [`render_chessboard`] output, row-major. A
/// corner between pixels `x - 1` and `x` lies at `x - 0.5`.
pub fn board_corner_pixels(pattern: &CalibrationPattern, square_px: u32, border_px: u32) -> Vec<Point2<f64>> {
    let mut corners = Vec::with_capacity(pattern.corner_count());
    for r in 0..pattern.rows() {
        for c in 0..pattern.cols() {
            corners.push(Point2::new(
                (border_px + (c as u32 + 1) * square_px) as f64 - 0.5,
                (border_px + (r as u32 + 1) * square_px) as f64 - 0.5,
            ));
        }
    }
    corners
}

/// Intensity of board coordinates `(bx, by)`: squares, then a one-square light
/// margin, then `background`.
fn board_intensity(pattern: &CalibrationPattern, bx: f64, by: f64, background: u8) -> u8 {
    let s = pattern.square_size();
    let i = (bx / s).floor() as i64 + 1;
    let j = (by / s).floor() as i64 + 1;
    let (nx, ny) = (pattern.cols() as i64 + 1, pattern.rows() as i64 + 1);
    if i < -1 || j < -1 || i > nx || j > ny {
        return background;
    }
    if i < 0 || j < 0 || i >= nx || j >= ny {
        return LIGHT;
    }
    if (i + j) % 2 == 0 {
        DARK
    } else {
        LIGHT
    }
}

/// Renders the board as seen by `model` under `pose`, with 3x3 supersampling.
pub fn render_board_view(
    pattern: &CalibrationPattern,
    model: &CameraModel,
    pose: &Pose,
    background: u8,
) -> GrayImage {
    let (width, height) = model.intrinsics.image_size();
    let mut image = GrayImage::new(width, height);
    let normal = pose.rotation.column(2).into_owned();
    let plane_d = normal.dot(&pose.translation);
    let r_t = pose.rotation.transpose();
    const OFFSETS: [f64; 3] = [-1.0 / 3.0, 0.0, 1.0 / 3.0];

    image
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                let mut acc = 0u32;
                for dy in OFFSETS {
                    for dx in OFFSETS {
                        let n = model.undistort_pixel(&Point2::new(x as f64 + dx, y as f64 + dy));
                        let ray = Vector3::new(n.x, n.y, 1.0);
                        let denom = normal.dot(&ray);
                        let lambda = plane_d / denom;
                        acc += if denom.abs() > 1e-12 && lambda > 0.0 {
                            let b = r_t * (ray * lambda - pose.translation);
                            board_intensity(pattern, b.x, b.y, background) as u32
                        } else {
                            background as u32
                        };
                    }
                }
                *px = ((acc + 4) / 9) as u8;
            }
        });
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::{CameraIntrinsics, Distortion};
    use nalgebra::Matrix3;

    #[test]
    fn printable_board_layout() {
        let pattern = CalibrationPattern::new(4, 3, 1.0).unwrap();
        let img = render_chessboard(&pattern, 10, 5).unwrap();
        assert_eq!(img.dimensions(), (5 * 10 + 10, 4 * 10 + 10));
        assert_eq!(img.get_pixel(0, 0)[0], 255);
        assert_eq!(img.get_pixel(5, 5)[0], 0);
        assert_eq!(img.get_pixel(15, 5)[0], 255);
        let corners = board_corner_pixels(&pattern, 10, 5);
        assert_eq!(corners.len(), 12);
        assert_eq!(corners[0], Point2::new(14.5, 14.5));
        assert_eq!(corners[11], Point2::new(44.5, 34.5));
    }

    #[test]
    fn fronto_parallel_view_places_squares() {
        let pattern = CalibrationPattern::new(4, 3, 10.0).unwrap();
        let model = CameraModel::new(
            CameraIntrinsics::new(100.0, 100.0, 50.0, 40.0, 100, 80),
            Distortion::none(),
        );
        // board corner (0, 0) on the optical axis, 100 units away
        let pose = Pose::new(Matrix3::identity(), Vector3::new(0.0, 0.0, 100.0));
        let img = render_board_view(&pattern, &model, &pose, 128);
        // square (1, 1) spans board [0, 10) x [0, 10), i.e. pixels 50..60
        assert_eq!(img.get_pixel(55, 45)[0], DARK);
        assert_eq!(img.get_pixel(45, 45)[0], LIGHT);
        assert_eq!(img.get_pixel(2, 2)[0], 128);
    }
}
