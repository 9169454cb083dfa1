//! Synthetic multi-view fixtures shared by unit tests.

use cv_core::{CameraIntrinsics, CameraModel, Distortion, Pose};
use nalgebra::{Point3, Vector3};

use crate::observation::{Observation, ObservationStore};
use crate::pattern::CalibrationPattern;

pub fn pattern() -> CalibrationPattern {
    CalibrationPattern::new(9, 6, 25.0).unwrap()
}

pub fn left_model() -> CameraModel {
    CameraModel::new(
        CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0, 640, 480),
        Distortion::new(-0.08, 0.05, 0.0005, -0.0003, 0.0),
    )
}

pub fn right_model() -> CameraModel {
    CameraModel::new(
        CameraIntrinsics::new(790.0, 795.0, 326.0, 236.0, 640, 480),
        Distortion::new(-0.06, 0.03, 0.0, 0.0, 0.0),
    )
}

/// Right camera relative to the left: 60 units to the side, slightly toed in.
pub fn relative_pose() -> Pose {
    Pose::from_rotation_vector(&Vector3::new(0.0, 0.02, 0.005), Vector3::new(-60.0, 0.0, 0.0))
}

/// Board poses centred in front of the camera at varied tilts.
pub fn board_poses(pattern: &CalibrationPattern) -> Vec<Pose> {
    let centre = Vector3::new(
        (pattern.cols() - 1) as f64 * pattern.square_size() / 2.0,
        (pattern.rows() - 1) as f64 * pattern.square_size() / 2.0,
        0.0,
    );
    let views = [
        (Vector3::new(0.25, 0.0, 0.0), Vector3::new(0.0, 0.0, 600.0)),
        (Vector3::new(0.0, 0.3, 0.0), Vector3::new(10.0, -5.0, 650.0)),
        (Vector3::new(-0.25, 0.15, 0.05), Vector3::new(-15.0, 10.0, 620.0)),
        (Vector3::new(0.1, -0.3, -0.1), Vector3::new(5.0, 15.0, 700.0)),
        (Vector3::new(0.3, 0.25, 0.0), Vector3::new(-10.0, -10.0, 680.0)),
        (Vector3::new(-0.1, -0.2, 0.15), Vector3::new(20.0, 0.0, 580.0)),
        (Vector3::new(-0.3, 0.05, -0.05), Vector3::new(0.0, -20.0, 640.0)),
    ];
    views
        .iter()
        .map(|(rvec, offset)| {
            let r = cv_core::rodrigues_to_rotation_matrix(rvec);
            Pose::new(r, offset - r * centre)
        })
        .collect()
}

pub fn observe(pattern: &CalibrationPattern, model: &CameraModel, pose: &Pose) -> Observation {
    let world: Vec<Point3<f64>> = pattern.world_points();
    let image = world
        .iter()
        .map(|p| model.project_with_pose(pose, p).unwrap())
        .collect();
    Observation::new(world, image).unwrap()
}

pub fn store(pattern: &CalibrationPattern, model: &CameraModel, poses: &[Pose]) -> ObservationStore {
    let mut store = ObservationStore::with_image_size(*pattern, model.intrinsics.image_size());
    for pose in poses {
        store.push(observe(pattern, model, pose)).unwrap();
    }
    store
}

/// Left and right stores of the same board poses seen through the rig.
pub fn stereo_stores() -> (ObservationStore, ObservationStore) {
    let pattern = pattern();
    let poses = board_poses(&pattern);
    let rel = relative_pose();
    let right_poses: Vec<Pose> = poses.iter().map(|p| rel.compose(p)).collect();
    (
        store(&pattern, &left_model(), &poses),
        store(&pattern, &right_model(), &right_poses),
    )
}
