use image::GrayImage;
use nalgebra::{Point2, Point3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::chessboard::ChessboardDetector;
use crate::{CalibError, Result};

/// Planar chessboard target: `cols x rows` interior corners spaced by `square_size`.
///
/// The square size sets the length unit of every translation and baseline
/// derived from observations of this pattern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PatternDescriptor", into = "PatternDescriptor")]
pub struct CalibrationPattern {
    cols: usize,
    rows: usize,
    square_size: f64,
}

/// Serialized form of a [`CalibrationPattern`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternDescriptor {
    pub cols: usize,
    pub rows: usize,
    pub square_size: f64,
}

impl CalibrationPattern {
    pub fn new(cols: usize, rows: usize, square_size: f64) -> Result<Self> {
        if cols < 2 || rows < 2 {
            return Err(CalibError::InvalidParameters(format!(
                "pattern must have at least 2x2 interior corners, got {cols}x{rows}"
            )));
        }
        if !(square_size.is_finite() && square_size > 0.0) {
            return Err(CalibError::InvalidParameters(format!(
                "square size must be positive, got {square_size}"
            )));
        }
        Ok(Self {
            cols,
            rows,
            square_size,
        })
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn square_size(&self) -> f64 {
        self.square_size
    }

    /// `(cols, rows)`.
    pub fn pattern_size(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    pub fn corner_count(&self) -> usize {
        self.cols * self.rows
    }

    /// Corner (r, c) sits at `(c * square_size, r * square_size, 0)`, row-major.
    pub fn world_points(&self) -> Vec<Point3<f64>> {
        let mut points = Vec::with_capacity(self.corner_count());
        for r in 0..self.rows {
            for c in 0..self.cols {
                points.push(Point3::new(
                    c as f64 * self.square_size,
                    r as f64 * self.square_size,
                    0.0,
                ));
            }
        }
        points
    }
}

impl TryFrom<PatternDescriptor> for CalibrationPattern {
    type Error = CalibError;

    fn try_from(d: PatternDescriptor) -> Result<Self> {
        Self::new(d.cols, d.rows, d.square_size)
    }
}

impl From<CalibrationPattern> for PatternDescriptor {
    fn from(p: CalibrationPattern) -> Self {
        Self {
            cols: p.cols,
            rows: p.rows,
            square_size: p.square_size,
        }
    }
}

/// Termination criteria of [`corner_subpix`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubpixCriteria {
    /// Half side of the search window; 5 gives an 11x11 window.
    pub half_window: usize,
    pub max_iterations: usize,
    /// Stop once a corner moves less than this many pixels.
    pub epsilon: f64,
}

impl Default for SubpixCriteria {
    fn default() -> Self {
        Self {
            half_window: 5,
            max_iterations: 30,
            epsilon: 1e-3,
        }
    }
}

/// Outcome of a detection; `corners` is empty whenever `found` is false.
#[derive(Debug, Clone, PartialEq)]
pub struct CornerDetection {
    pub found: bool,
    pub corners: Vec<Point2<f64>>,
}

impl CornerDetection {
    pub fn not_found() -> Self {
        Self {
            found: false,
            corners: Vec::new(),
        }
    }
}

/// Detect the interior corners of `pattern` with the default detector settings.
///
/// Corners come back in the order of [`CalibrationPattern::world_points`].
pub fn detect_corners(image: &GrayImage, pattern: &CalibrationPattern) -> CornerDetection {
    ChessboardDetector::default().detect(image, pattern)
}

/// Detect chessboard corners in an image.
///
/// # Arguments
///
/// * `image` - Input grayscale image
/// * `pattern_size` - Expected pattern size as (cols, rows)
///
/// # Returns
///
/// The ordered corners, or `PatternNotFound` if no complete board is visible.
pub fn find_chessboard_corners(
    image: &GrayImage,
    pattern_size: (usize, usize),
) -> Result<Vec<Point2<f64>>> {
    let (cols, rows) = pattern_size;
    let pattern = CalibrationPattern::new(cols, rows, 1.0)?;
    let detection = detect_corners(image, &pattern);
    if !detection.found {
        return Err(CalibError::PatternNotFound(format!(
            "no {cols}x{rows} chessboard in {}x{} image",
            image.width(),
            image.height()
        )));
    }
    Ok(detection.corners)
}

/// Refine corner positions to sub-pixel accuracy.
///
/// Each corner `q` is moved to the point where the image gradient at every
/// neighbouring pixel `p` is orthogonal to `p - q`, solved as a weighted 2x2
/// least-squares problem and iterated with the window re-centred on the new
/// estimate. A corner that would leave its initial window keeps its initial
/// position.
pub fn corner_subpix(
    image: &GrayImage,
    corners: &mut [Point2<f64>],
    criteria: &SubpixCriteria,
) -> Result<()> {
    let win = criteria.half_window;
    if win == 0 {
        return Err(CalibError::InvalidParameters(
            "half_window must be >= 1".to_string(),
        ));
    }
    if image.width() == 0 || image.height() == 0 {
        return Err(CalibError::InvalidParameters(
            "cannot refine corners in an empty image".to_string(),
        ));
    }
    let w = image.width() as f64;
    let h = image.height() as f64;
    let eps2 = criteria.epsilon * criteria.epsilon;

    let span = 2 * win + 1;
    let inv_sigma2 = 1.0 / (win * win) as f64;
    let mask: Vec<f64> = (0..span * span)
        .map(|k| {
            let dx = (k % span) as f64 - win as f64;
            let dy = (k / span) as f64 - win as f64;
            (-(dx * dx) * inv_sigma2).exp() * (-(dy * dy) * inv_sigma2).exp()
        })
        .collect();

    corners.par_iter_mut().for_each(|p| {
        let start = *p;
        let mut q = start;
        let mut buf = vec![0.0f64; (span + 2) * (span + 2)];
        for _ in 0..criteria.max_iterations {
            // window of bilinear samples with a one pixel apron for gradients
            let side = span + 2;
            for (k, v) in buf.iter_mut().enumerate() {
                let dx = (k % side) as f64 - (win + 1) as f64;
                let dy = (k / side) as f64 - (win + 1) as f64;
                *v = sample_bilinear(image, q.x + dx, q.y + dy);
            }

            let (mut a, mut b, mut c, mut bb1, mut bb2) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for iy in 0..span {
                for ix in 0..span {
                    let m = mask[iy * span + ix];
                    let at = |x: usize, y: usize| buf[y * side + x];
                    let gx = at(ix + 2, iy + 1) - at(ix, iy + 1);
                    let gy = at(ix + 1, iy + 2) - at(ix + 1, iy);
                    let gxx = gx * gx * m;
                    let gxy = gx * gy * m;
                    let gyy = gy * gy * m;
                    let px = ix as f64 - win as f64;
                    let py = iy as f64 - win as f64;
                    a += gxx;
                    b += gxy;
                    c += gyy;
                    bb1 += gxx * px + gxy * py;
                    bb2 += gxy * px + gyy * py;
                }
            }

            let det = a * c - b * b;
            if det.abs() <= f64::EPSILON * (a * c).abs().max(1.0) {
                break;
            }
            let next = Point2::new(
                q.x + (c * bb1 - b * bb2) / det,
                q.y + (a * bb2 - b * bb1) / det,
            );
            let moved = (next - q).norm_squared();
            q = next;
            if q.x < 0.0 || q.y < 0.0 || q.x >= w || q.y >= h || moved <= eps2 {
                break;
            }
        }
        let escaped = (q.x - start.x).abs() > win as f64 || (q.y - start.y).abs() > win as f64;
        if escaped || !q.x.is_finite() || !q.y.is_finite() {
            q = start;
        }
        *p = q;
    });
    Ok(())
}

/// Bilinear intensity lookup with edge clamping.
fn sample_bilinear(image: &GrayImage, x: f64, y: f64) -> f64 {
    let max_x = (image.width() - 1) as f64;
    let max_y = (image.height() - 1) as f64;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let x0 = x0 as u32;
    let y0 = y0 as u32;
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let p = |x: u32, y: u32| image.get_pixel(x, y)[0] as f64;
    let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
    let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
    top * (1.0 - fy) + bottom * fy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_points_are_row_major_on_the_board_plane() {
        for (cols, rows, square) in [(2, 2, 1.0), (3, 2, 10.0), (9, 6, 25.0), (7, 7, 0.5), (4, 11, 30.0)] {
            let pattern = CalibrationPattern::new(cols, rows, square).unwrap();
            let points = pattern.world_points();
            assert_eq!(points.len(), rows * cols);
            assert_eq!(pattern.corner_count(), rows * cols);
            for r in 0..rows {
                for c in 0..cols {
                    let p = points[r * cols + c];
                    assert_eq!(p, Point3::new(c as f64 * square, r as f64 * square, 0.0));
                }
            }
        }
    }

    #[test]
    fn degenerate_patterns_are_rejected() {
        for (cols, rows, square) in [
            (1, 6, 25.0),
            (9, 1, 25.0),
            (0, 0, 25.0),
            (9, 6, 0.0),
            (9, 6, -5.0),
            (9, 6, f64::NAN),
            (9, 6, f64::INFINITY),
        ] {
            assert!(
                matches!(
                    CalibrationPattern::new(cols, rows, square),
                    Err(CalibError::InvalidParameters(_))
                ),
                "{cols}x{rows} @ {square} accepted"
            );
        }
    }

    #[test]
    fn descriptor_json_is_validated() {
        let pattern: CalibrationPattern =
            serde_json::from_str(r#"{"cols": 9, "rows": 6, "square_size": 25.0}"#).unwrap();
        assert_eq!(pattern.pattern_size(), (9, 6));
        assert_eq!(serde_json::to_value(pattern).unwrap()["square_size"], 25.0);

        assert!(serde_json::from_str::<CalibrationPattern>(r#"{"cols": 1, "rows": 6, "square_size": 25.0}"#).is_err());
        assert!(serde_json::from_str::<CalibrationPattern>(r#"{"cols": 9, "rows": 6, "square_size": 0.0}"#).is_err());
    }

    #[test]
    fn subpix_rejects_a_zero_window_and_empty_image() {
        let mut corners = vec![Point2::new(1.0, 1.0)];
        let criteria = SubpixCriteria {
            half_window: 0,
            ..Default::default()
        };
        assert!(corner_subpix(&GrayImage::new(20, 20), &mut corners, &criteria).is_err());
        assert!(corner_subpix(&GrayImage::new(0, 0), &mut corners, &SubpixCriteria::default()).is_err());
    }
}
