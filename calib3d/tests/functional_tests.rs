use cv_calib3d::*;
use cv_core::{rodrigues_to_rotation_matrix, rotation_angle_deg, CameraIntrinsics, CameraModel, Distortion, Pose};
use image::GrayImage;
use nalgebra::Vector3;

fn pattern() -> CalibrationPattern {
    CalibrationPattern::new(9, 6, 25.0).unwrap()
}

fn camera(fx: f64, cx: f64, cy: f64) -> CameraModel {
    CameraModel::new(
        CameraIntrinsics::new(fx, fx, cx, cy, 640, 480),
        Distortion::none(),
    )
}

fn board_poses(pattern: &CalibrationPattern) -> Vec<Pose> {
    let centre = Vector3::new(
        (pattern.cols() - 1) as f64 * pattern.square_size() / 2.0,
        (pattern.rows() - 1) as f64 * pattern.square_size() / 2.0,
        0.0,
    );
    [
        (Vector3::new(0.25, 0.0, 0.0), Vector3::new(0.0, 0.0, 600.0)),
        (Vector3::new(0.0, 0.3, 0.0), Vector3::new(10.0, -5.0, 650.0)),
        (Vector3::new(-0.25, 0.15, 0.05), Vector3::new(-15.0, 10.0, 620.0)),
        (Vector3::new(0.1, -0.3, -0.1), Vector3::new(5.0, 15.0, 700.0)),
        (Vector3::new(0.3, 0.25, 0.0), Vector3::new(-10.0, -10.0, 680.0)),
        (Vector3::new(-0.1, -0.2, 0.15), Vector3::new(20.0, 0.0, 580.0)),
    ]
    .iter()
    .map(|(rvec, offset)| {
        let r = rodrigues_to_rotation_matrix(rvec);
        Pose::new(r, offset - r * centre)
    })
    .collect()
}

fn relative_pose() -> Pose {
    Pose::from_rotation_vector(&Vector3::new(0.0, 0.02, 0.0), Vector3::new(-60.0, 0.0, 0.0))
}

fn render_views(model: &CameraModel, poses: &[Pose]) -> Vec<GrayImage> {
    poses
        .iter()
        .map(|pose| render_board_view(&pattern(), model, pose, 128))
        .collect()
}

#[test]
fn test_mono_calibration_from_rendered_views() {
    let truth = camera(800.0, 320.0, 240.0);
    let images = render_views(&truth, &board_poses(&pattern()));
    let mut store = ObservationStore::new(pattern());
    let added = store.add_batch(&images);
    assert!(added.iter().all(|a| *a), "detections: {added:?}");

    let calib = calibrate_mono(&store, (640, 480)).unwrap();
    let k = calib.model.intrinsics;
    assert!((k.fx - 800.0).abs() < 8.0, "fx {}", k.fx);
    assert!((k.fy - 800.0).abs() < 8.0, "fy {}", k.fy);
    assert!((k.cx - 320.0).abs() < 3.2, "cx {}", k.cx);
    assert!((k.cy - 240.0).abs() < 2.4, "cy {}", k.cy);
    assert!(calib.rms_reprojection_error < 0.1, "rms {}", calib.rms_reprojection_error);
    assert_eq!(calib.extrinsics.len(), store.len());

    let report = validate_mono(&calib, &store).unwrap();
    assert!((report.rms_error - calib.rms_reprojection_error).abs() < 1e-6);
    assert_eq!(report.quality, QualityBand::Excellent);
}

#[test]
fn test_empty_store_is_insufficient() {
    let store = ObservationStore::new(pattern());
    let err = calibrate_mono(&store, (640, 480)).unwrap_err();
    assert!(matches!(err, CalibError::InsufficientObservations(_)));
}

#[test]
fn test_mismatched_resolution_never_contributes() {
    let truth = camera(800.0, 320.0, 240.0);
    let images = render_views(&truth, &board_poses(&pattern())[..1]);
    let mut store = ObservationStore::with_image_size(pattern(), (800, 600));
    assert!(!store.add(&images[0]));
    assert!(store.is_empty());
}

#[test]
fn test_stereo_pipeline_from_rendered_pairs() {
    let left_model = camera(800.0, 320.0, 240.0);
    let right_model = camera(790.0, 325.0, 238.0);
    let rel = relative_pose();
    let poses = board_poses(&pattern());
    let right_poses: Vec<Pose> = poses.iter().map(|p| rel.compose(p)).collect();
    let left_images = render_views(&left_model, &poses);
    let right_images = render_views(&right_model, &right_poses);

    let mut stores = StereoObservationStore::new(pattern());
    for (l, r) in left_images.iter().zip(&right_images) {
        assert!(stores.add_pair(l, r));
    }
    let (left_store, right_store) = stores.into_parts();
    let left = calibrate_mono(&left_store, (640, 480)).unwrap();
    let right = calibrate_mono(&right_store, (640, 480)).unwrap();
    let stereo = calibrate_stereo(&left_store, &right_store, &left, &right, true).unwrap();

    assert!((stereo.pose.baseline - 60.0).abs() < 1.2, "baseline {}", stereo.pose.baseline);
    let rot_err = rotation_angle_deg(&(stereo.pose.rotation * rel.rotation.transpose()));
    assert!(rot_err < 0.5, "rotation error {rot_err} deg");
    assert!(stereo.pose.reprojection_error < 0.2);

    let set = rectify(&stereo.left, &stereo.right, &stereo.pose).unwrap();
    for (lo, ro) in left_store.observations().iter().zip(right_store.observations()) {
        for (pl, pr) in lo.image_points().iter().zip(ro.image_points()) {
            let ql = set.rectify_left_point(&stereo.left, pl);
            let qr = set.rectify_right_point(&stereo.right, pr);
            assert!((ql.y - qr.y).abs() < 0.5, "row {} vs {}", ql.y, qr.y);
        }
    }

    let validation = validate_stereo(&stereo, &left_store, &right_store).unwrap();
    assert!((validation.combined_rms - stereo.pose.reprojection_error).abs() < 1e-6);

    let record = CalibrationRecord::from(StereoRecord::from_calibration(&stereo, Some(&set)));
    let loaded = CalibrationRecord::from_json(&record.to_json().unwrap()).unwrap();
    assert_eq!(loaded, record);
    let stereo_record = loaded.as_stereo().unwrap();
    assert!(stereo_record.is_rectified());
    assert_eq!(stereo_record.pose().translation, stereo.pose.translation);
    assert_eq!(stereo_record.left_model(), stereo.left);
}

#[test]
fn test_stereo_session_walks_every_state() {
    let left_model = camera(800.0, 320.0, 240.0);
    let right_model = camera(800.0, 320.0, 240.0);
    let rel = relative_pose();
    let poses = board_poses(&pattern());
    let right_poses: Vec<Pose> = poses.iter().map(|p| rel.compose(p)).collect();

    let mut session = StereoSession::new(pattern());
    assert_eq!(session.state(), PipelineState::Collecting);
    for (l, r) in render_views(&left_model, &poses)
        .iter()
        .zip(&render_views(&right_model, &right_poses))
    {
        assert!(session.add_pair(l, r).unwrap());
    }
    assert_eq!(session.state(), PipelineState::ReadyForSolve);
    assert!(matches!(
        session.calibrate_stereo(false),
        Err(CalibError::InvalidState(_))
    ));

    session.calibrate_mono().unwrap();
    assert_eq!(session.left_state(), PipelineState::Solved);
    assert_eq!(session.right_state(), PipelineState::Solved);

    session.calibrate_stereo(false).unwrap();
    assert_eq!(session.state(), PipelineState::Solved);
    session.rectify().unwrap();
    assert_eq!(session.state(), PipelineState::Rectified);

    let blank = GrayImage::new(640, 480);
    assert!(matches!(
        session.add_pair(&blank, &blank),
        Err(CalibError::InvalidState(_))
    ));
    assert!(matches!(session.record().unwrap(), CalibrationRecord::Stereo(_)));
}

#[test]
fn test_printable_board_is_detected_exactly() {
    let pattern = pattern();
    let board = render_chessboard(&pattern, 30, 40).unwrap();
    let truth = board_corner_pixels(&pattern, 30, 40);
    let detection = detect_corners(&board, &pattern);
    assert!(detection.found);
    for (c, t) in detection.corners.iter().zip(&truth) {
        assert!((c - t).norm() < 0.2, "{c:?} vs {t:?}");
    }
}

#[test]
fn test_undistort_image_identity_for_zero_distortion() {
    let pattern = pattern();
    let board = render_chessboard(&pattern, 20, 20).unwrap();
    let (w, h) = board.dimensions();
    let model = CameraModel::new(
        CameraIntrinsics::new(300.0, 300.0, w as f64 / 2.0, h as f64 / 2.0, w, h),
        Distortion::none(),
    );
    assert_eq!(undistort_image(&board, &model, None).unwrap(), board);
}
