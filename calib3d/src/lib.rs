pub type CalibError = cv_core::Error;
pub type Result<T> = cv_core::Result<T>;

// Module declarations
pub mod pattern;
pub use pattern::{
    corner_subpix, detect_corners, find_chessboard_corners, CalibrationPattern, CornerDetection,
    PatternDescriptor, SubpixCriteria,
};

pub mod chessboard;
pub use chessboard::{chess_response, ChessboardDetector, ChessboardParams};

pub mod observation;
pub use observation::{Observation, ObservationStore, StereoObservationStore};

pub mod project;
pub use project::{project_points, reprojection_distances};

pub mod homography;
pub use homography::{estimate_homography_dlt, estimate_planar_pose};

pub mod solver;
pub use solver::{levenberg_marquardt, LeastSquaresProblem, LmOptions, LmReport};

pub mod calibration;
pub use calibration::{
    calibrate_mono, calibrate_mono_with_options, MonoCalibration, MonoCalibrationOptions,
};

pub mod essential_fundamental;
pub use essential_fundamental::{epipolar_distance, essential_from_pose, fundamental_from_essential};

pub mod stereo;
pub use stereo::{
    calibrate_stereo, calibrate_stereo_from_models, calibrate_stereo_with_options,
    StereoCalibration, StereoCalibrationOptions, StereoPose,
};

pub mod distortion;
pub use distortion::{
    crop_to_roi, distort_point, init_undistort_rectify_map, optimal_new_camera_matrix, remap,
    undistort_image, undistort_points, RemapTable, Roi,
};

pub mod rectify;
pub use rectify::{rectify, rectify_pair, rectify_with_options, RectificationSet, RectifyOptions};

pub mod validate;
pub use validate::{
    compare_calibrations, validate_model, validate_mono, validate_stereo, BetterCalibration,
    CalibrationComparison, QualityBand, StereoValidationReport, ValidationReport,
};

pub mod persistence;
pub use persistence::{CalibrationRecord, MonoRecord, StereoRecord, SCHEMA_VERSION};

pub mod session;
pub use session::{MonoSession, PipelineState, StereoSession};

pub mod board;
pub use board::{board_corner_pixels, render_board_view, render_chessboard};

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use nalgebra::Point2;

    fn synthetic_checkerboard(
        pattern: (usize, usize),
        square: u32,
        margin_x: u32,
        margin_y: u32,
    ) -> (GrayImage, Vec<Point2<f64>>) {
        let (cols, rows) = pattern;
        let squares_x = cols as u32 + 1;
        let squares_y = rows as u32 + 1;
        let width = margin_x * 2 + squares_x * square;
        let height = margin_y * 2 + squares_y * square;
        let mut img = GrayImage::from_pixel(width, height, Luma([180]));

        for sy in 0..squares_y {
            for sx in 0..squares_x {
                let is_black = (sx + sy) % 2 == 0;
                let val = if is_black { 30u8 } else { 220u8 };
                let x0 = margin_x + sx * square;
                let y0 = margin_y + sy * square;
                for y in y0..(y0 + square) {
                    for x in x0..(x0 + square) {
                        img.put_pixel(x, y, Luma([val]));
                    }
                }
            }
        }

        let mut gt = Vec::with_capacity(cols * rows);
        for y in 0..rows {
            for x in 0..cols {
                gt.push(Point2::new(
                    (margin_x + (x as u32 + 1) * square) as f64 - 0.5,
                    (margin_y + (y as u32 + 1) * square) as f64 - 0.5,
                ));
            }
        }
        (img, gt)
    }

    #[test]
    fn find_chessboard_corners_matches_ground_truth_in_order() {
        let pattern = (7, 6);
        let (img, gt) = synthetic_checkerboard(pattern, 20, 40, 30);
        let corners = find_chessboard_corners(&img, pattern).unwrap();
        assert_eq!(corners.len(), pattern.0 * pattern.1);
        for (c, g) in corners.iter().zip(&gt) {
            assert!((c - g).norm() < 0.2, "corner {c:?} vs {g:?}");
        }
    }

    #[test]
    fn detect_corners_reports_not_found_on_featureless_images() {
        let pattern = CalibrationPattern::new(7, 6, 1.0).unwrap();
        let blank = GrayImage::from_pixel(200, 160, Luma([128]));
        let gradient = GrayImage::from_fn(200, 160, |x, _| Luma([(x + 20) as u8]));
        for img in [blank, gradient] {
            let detection = detect_corners(&img, &pattern);
            assert!(!detection.found);
            assert!(detection.corners.is_empty());
        }
        let blank = GrayImage::from_pixel(200, 160, Luma([128]));
        assert!(matches!(
            find_chessboard_corners(&blank, (7, 6)),
            Err(CalibError::PatternNotFound(_))
        ));
    }

    #[test]
    fn wrong_pattern_size_is_not_found() {
        let (img, _) = synthetic_checkerboard((7, 6), 20, 40, 30);
        let pattern = CalibrationPattern::new(8, 6, 1.0).unwrap();
        assert!(!detect_corners(&img, &pattern).found);
    }

    #[test]
    fn corner_subpix_refines_toward_local_corner() {
        let (img, gt) = synthetic_checkerboard((7, 6), 24, 30, 30);
        let mut p = vec![Point2::new(gt[10].x + 2.3, gt[10].y - 1.9)];
        let before = (p[0] - gt[10]).norm();
        corner_subpix(&img, &mut p, &SubpixCriteria::default()).unwrap();
        let after = (p[0] - gt[10]).norm();
        assert!(after < before);
        assert!(after < 0.1, "refined corner {:?} vs {:?}", p[0], gt[10]);
    }

    #[test]
    fn store_accumulates_only_detected_views() {
        let pattern = CalibrationPattern::new(7, 6, 20.0).unwrap();
        let (img, _) = synthetic_checkerboard((7, 6), 20, 40, 30);
        let blank = GrayImage::from_pixel(img.width(), img.height(), Luma([128]));
        let mut store = ObservationStore::new(pattern);
        assert_eq!(store.add_batch(&[img.clone(), blank, img]), vec![true, false, true]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.image_size(), Some((240, 200)));
        assert_eq!(store.object_points()[1], pattern.world_points());
    }

    #[test]
    fn stereo_store_stays_aligned() {
        let pattern = CalibrationPattern::new(7, 6, 20.0).unwrap();
        let (img, _) = synthetic_checkerboard((7, 6), 20, 40, 30);
        let blank = GrayImage::from_pixel(img.width(), img.height(), Luma([128]));
        let mut stereo = StereoObservationStore::new(pattern);
        assert!(stereo.add_pair(&img, &img));
        assert!(!stereo.add_pair(&img, &blank));
        assert!(!stereo.add_pair(&blank, &img));
        let added = stereo.add_pairs(&[(img.clone(), img.clone()), (blank.clone(), blank)]);
        assert_eq!(added, vec![true, false]);
        assert_eq!(stereo.left().len(), stereo.right().len());
        assert_eq!(stereo.len(), 2);
    }
}
