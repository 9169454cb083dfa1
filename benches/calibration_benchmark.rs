use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cv_calib::calib3d::*;
use cv_calib::core::{rodrigues_to_rotation_matrix, CameraIntrinsics, CameraModel, Distortion, Pose};
use nalgebra::{Point2, Vector3};

fn camera() -> CameraModel {
    CameraModel::new(
        CameraIntrinsics::new(820.0, 790.0, 320.0, 240.0, 640, 480),
        Distortion::new(-0.1, 0.04, 0.0005, -0.0002, 0.0),
    )
}

fn board_poses(pattern: &CalibrationPattern) -> Vec<Pose> {
    let centre = Vector3::new(
        (pattern.cols() - 1) as f64 * pattern.square_size() / 2.0,
        (pattern.rows() - 1) as f64 * pattern.square_size() / 2.0,
        0.0,
    );
    [
        Vector3::new(0.25, -0.05, 0.02),
        Vector3::new(-0.2, 0.3, -0.05),
        Vector3::new(0.05, -0.3, 0.1),
        Vector3::new(0.3, 0.2, 0.0),
        Vector3::new(-0.15, -0.2, -0.1),
    ]
    .iter()
    .enumerate()
    .map(|(i, rvec)| {
        let r = rodrigues_to_rotation_matrix(rvec);
        Pose::new(r, Vector3::new(0.0, 0.0, 600.0 + 20.0 * i as f64) - r * centre)
    })
    .collect()
}

fn synthetic_store() -> ObservationStore {
    let pattern = CalibrationPattern::new(9, 6, 25.0).unwrap();
    let model = camera();
    let mut store = ObservationStore::with_image_size(pattern, (640, 480));
    for pose in board_poses(&pattern) {
        let world = pattern.world_points();
        let image: Vec<Point2<f64>> = world
            .iter()
            .map(|p| model.project_with_pose(&pose, p).unwrap())
            .collect();
        store.push(Observation::new(world, image).unwrap()).unwrap();
    }
    store
}

fn benchmark_planar_calibration(c: &mut Criterion) {
    let store = synthetic_store();

    c.bench_function("calibrate_mono_5_views", |b| {
        b.iter(|| black_box(calibrate_mono(&store, (640, 480))));
    });
}

fn benchmark_calibration_with_flags(c: &mut Criterion) {
    let store = synthetic_store();
    let options = MonoCalibrationOptions {
        fix_principal_point: true,
        zero_tangent_dist: true,
        fix_k3: true,
        ..Default::default()
    };

    c.bench_function("calibrate_mono_fixed_pp_no_tangent", |b| {
        b.iter(|| black_box(calibrate_mono_with_options(&store, (640, 480), &options)));
    });
}

fn benchmark_corner_detection(c: &mut Criterion) {
    let pattern = CalibrationPattern::new(9, 6, 25.0).unwrap();
    let model = CameraModel::new(camera().intrinsics, Distortion::none());
    let view = render_board_view(&pattern, &model, &board_poses(&pattern)[0], 128);
    let printable = render_chessboard(&pattern, 40, 60).unwrap();

    let mut group = c.benchmark_group("detection");
    group.bench_function("detect_corners_rendered_view", |b| {
        b.iter(|| black_box(detect_corners(&view, &pattern)));
    });
    group.bench_function("detect_corners_printable_board", |b| {
        b.iter(|| black_box(detect_corners(&printable, &pattern)));
    });
    group.bench_function("chess_response_640x480", |b| {
        b.iter(|| black_box(chess_response(&view, 5)));
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_planar_calibration,
    benchmark_calibration_with_flags,
    benchmark_corner_detection
);
criterion_main!(benches);
