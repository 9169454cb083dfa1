//! Stereo extrinsic calibration
//!
//! Recovers the rigid transform from the left to the right camera of a rig
//! from synchronized chessboard observations, optionally refining both camera
//! models jointly with the relative pose.

use cv_core::{nearest_rotation, rotation_matrix_to_rodrigues, CameraModel, Pose};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibration::MonoCalibration;
use crate::essential_fundamental::{essential_from_pose, fundamental_from_essential};
use crate::homography::estimate_planar_pose;
use crate::observation::{Observation, ObservationStore};
use crate::pattern::CalibrationPattern;
use crate::project::{intrinsic_params, model_from_params, write_residuals, INTRINSIC_PARAMS, POSE_PARAMS};
use crate::solver::{levenberg_marquardt, LeastSquaresProblem, LmOptions, LmReport};
use crate::{CalibError, Result};

/// Offset of the relative pose in the stereo parameter layout
/// `[left 9][right 9][relative pose 6][left board pose 6 per view]`.
const REL_OFFSET: usize = 2 * INTRINSIC_PARAMS;
const VIEWS_OFFSET: usize = REL_OFFSET + POSE_PARAMS;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoCalibrationOptions {
    /// Hold tangential distortion at zero while refining intrinsics jointly.
    pub zero_tangent_dist: bool,
    /// Hold k3 at zero while refining intrinsics jointly.
    pub fix_k3: bool,
    pub solver: LmOptions,
}

/// Left-to-right rigid transform of a stereo rig: `x_right = R * x_left + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub essential_matrix: Matrix3<f64>,
    pub fundamental_matrix: Matrix3<f64>,
    /// RMS pixel error over both cameras.
    pub reprojection_error: f64,
    /// Magnitude of the dominant translation component, in pattern units.
    pub baseline: f64,
}

impl StereoPose {
    pub fn from_rigid(
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
        left: &CameraModel,
        right: &CameraModel,
        reprojection_error: f64,
    ) -> Self {
        let essential_matrix = essential_from_pose(&rotation, &translation);
        let fundamental_matrix =
            fundamental_from_essential(&essential_matrix, &left.intrinsics, &right.intrinsics);
        Self {
            rotation,
            translation,
            essential_matrix,
            fundamental_matrix,
            reprojection_error,
            baseline: baseline_of(&translation),
        }
    }

    pub fn as_pose(&self) -> Pose {
        Pose::new(self.rotation, self.translation)
    }

    /// Rodrigues vector of the rotation, in degrees.
    pub fn rotation_angles_deg(&self) -> Vector3<f64> {
        rotation_matrix_to_rodrigues(&self.rotation).map(f64::to_degrees)
    }
}

fn baseline_of(t: &Vector3<f64>) -> f64 {
    t.amax()
}

#[derive(Debug, Clone)]
pub struct StereoCalibration {
    pub left: CameraModel,
    pub right: CameraModel,
    pub pose: StereoPose,
    /// Board pose in the left camera per synchronized pair.
    pub left_extrinsics: Vec<Pose>,
    pub observation_count: usize,
    pub pattern: CalibrationPattern,
    /// Whether the camera models were held at their mono solutions.
    pub fix_intrinsics: bool,
    pub report: LmReport,
}

impl StereoCalibration {
    /// Board pose in the right camera per pair, `relative ∘ left`.
    pub fn right_extrinsics(&self) -> Vec<Pose> {
        let rel = self.pose.as_pose();
        self.left_extrinsics.iter().map(|p| rel.compose(p)).collect()
    }

    pub fn image_size(&self) -> (u32, u32) {
        self.left.intrinsics.image_size()
    }
}

/// Residual blocks `0..n` are the left views, `n..2n` the right views.
struct StereoProblem<'a> {
    left: &'a [Observation],
    right: &'a [Observation],
    left_size: (u32, u32),
    right_size: (u32, u32),
}

impl LeastSquaresProblem for StereoProblem<'_> {
    fn num_params(&self) -> usize {
        VIEWS_OFFSET + POSE_PARAMS * self.left.len()
    }

    fn num_blocks(&self) -> usize {
        2 * self.left.len()
    }

    fn block_len(&self, block: usize) -> usize {
        let n = self.left.len();
        if block < n {
            2 * self.left[block].len()
        } else {
            2 * self.right[block - n].len()
        }
    }

    fn block_residuals(&self, block: usize, params: &[f64], out: &mut [f64]) {
        let n = self.left.len();
        let view = block % n;
        let start = VIEWS_OFFSET + POSE_PARAMS * view;
        let board = Pose::from_params(&params[start..start + POSE_PARAMS]);
        if block < n {
            let model = model_from_params(&params[..INTRINSIC_PARAMS], self.left_size, None);
            write_residuals(&model, &board, &self.left[view], out);
        } else {
            let model = model_from_params(&params[INTRINSIC_PARAMS..REL_OFFSET], self.right_size, None);
            let rel = Pose::from_params(&params[REL_OFFSET..VIEWS_OFFSET]);
            write_residuals(&model, &rel.compose(&board), &self.right[view], out);
        }
    }

    fn touches(&self, param: usize, block: usize) -> bool {
        let n = self.left.len();
        let right = block >= n;
        if param < INTRINSIC_PARAMS {
            !right
        } else if param < VIEWS_OFFSET {
            right
        } else {
            (param - VIEWS_OFFSET) / POSE_PARAMS == block % n
        }
    }
}

/// Calibrate the rig from synchronized stores and the two mono solutions.
///
/// With `fix_intrinsics` the camera models are held at the mono results and
/// only the relative pose and board poses are refined.
pub fn calibrate_stereo(
    left_store: &ObservationStore,
    right_store: &ObservationStore,
    left: &MonoCalibration,
    right: &MonoCalibration,
    fix_intrinsics: bool,
) -> Result<StereoCalibration> {
    calibrate_stereo_with_options(
        left_store,
        right_store,
        left,
        right,
        fix_intrinsics,
        &StereoCalibrationOptions::default(),
    )
}

pub fn calibrate_stereo_with_options(
    left_store: &ObservationStore,
    right_store: &ObservationStore,
    left: &MonoCalibration,
    right: &MonoCalibration,
    fix_intrinsics: bool,
    options: &StereoCalibrationOptions,
) -> Result<StereoCalibration> {
    let left_poses = (left.extrinsics.len() == left_store.len()).then_some(left.extrinsics.as_slice());
    let right_poses =
        (right.extrinsics.len() == right_store.len()).then_some(right.extrinsics.as_slice());
    solve(
        left_store,
        right_store,
        (&left.model, left_poses),
        (&right.model, right_poses),
        fix_intrinsics,
        options,
    )
}

/// Stereo calibration from camera models alone, e.g. loaded from disk.
/// Board poses are re-estimated from the observations.
pub fn calibrate_stereo_from_models(
    left_store: &ObservationStore,
    right_store: &ObservationStore,
    left: &CameraModel,
    right: &CameraModel,
    fix_intrinsics: bool,
    options: &StereoCalibrationOptions,
) -> Result<StereoCalibration> {
    solve(
        left_store,
        right_store,
        (left, None),
        (right, None),
        fix_intrinsics,
        options,
    )
}

fn check_stores(
    left_store: &ObservationStore,
    right_store: &ObservationStore,
    left: &CameraModel,
    right: &CameraModel,
) -> Result<()> {
    if left_store.len() != right_store.len() {
        return Err(CalibError::SynchronizationMismatch {
            left: left_store.len(),
            right: right_store.len(),
        });
    }
    if left_store.is_empty() {
        return Err(CalibError::InsufficientObservations(
            "stereo calibration needs at least one synchronized pair".to_string(),
        ));
    }
    if left_store.pattern() != right_store.pattern() {
        return Err(CalibError::InvalidParameters(
            "left and right stores use different patterns".to_string(),
        ));
    }
    for (side, store, model) in [("left", left_store, left), ("right", right_store, right)] {
        let size = model.intrinsics.image_size();
        if let Some(store_size) = store.image_size() {
            if store_size != size {
                return Err(CalibError::InvalidParameters(format!(
                    "{side} store holds {}x{} images, camera model is {}x{}",
                    store_size.0, store_size.1, size.0, size.1
                )));
            }
        }
    }
    Ok(())
}

fn initial_poses(store: &ObservationStore, model: &CameraModel, known: Option<&[Pose]>) -> Result<Vec<Pose>> {
    match known {
        Some(poses) => Ok(poses.to_vec()),
        None => store
            .observations()
            .iter()
            .map(|obs| estimate_planar_pose(model, obs))
            .collect(),
    }
}

/// Chordal mean of the per-view relative rotations and mean translation.
fn initial_relative_pose(left: &[Pose], right: &[Pose]) -> Result<Pose> {
    let mut sum = Matrix3::zeros();
    for (l, r) in left.iter().zip(right) {
        sum += r.rotation * l.rotation.transpose();
    }
    let rotation = nearest_rotation(&sum).ok_or_else(|| {
        CalibError::InvalidParameters("relative rotation average is degenerate".to_string())
    })?;
    let mut translation = Vector3::zeros();
    for (l, r) in left.iter().zip(right) {
        translation += r.translation - rotation * l.translation;
    }
    translation /= left.len() as f64;
    Ok(Pose::new(rotation, translation))
}

fn intrinsic_mask(fix_intrinsics: bool, options: &StereoCalibrationOptions) -> [bool; INTRINSIC_PARAMS] {
    if fix_intrinsics {
        return [false; INTRINSIC_PARAMS];
    }
    [
        true,
        true,
        true,
        true,
        true,
        true,
        !options.zero_tangent_dist,
        !options.zero_tangent_dist,
        !options.fix_k3,
    ]
}

fn seeded_intrinsics(model: &CameraModel, fix_intrinsics: bool, options: &StereoCalibrationOptions) -> [f64; INTRINSIC_PARAMS] {
    let mut p = intrinsic_params(model);
    if !fix_intrinsics {
        if options.zero_tangent_dist {
            p[6] = 0.0;
            p[7] = 0.0;
        }
        if options.fix_k3 {
            p[8] = 0.0;
        }
    }
    p
}

fn solve(
    left_store: &ObservationStore,
    right_store: &ObservationStore,
    (left_model, left_known): (&CameraModel, Option<&[Pose]>),
    (right_model, right_known): (&CameraModel, Option<&[Pose]>),
    fix_intrinsics: bool,
    options: &StereoCalibrationOptions,
) -> Result<StereoCalibration> {
    check_stores(left_store, right_store, left_model, right_model)?;
    let n = left_store.len();

    let left_poses = initial_poses(left_store, left_model, left_known)?;
    let right_poses = initial_poses(right_store, right_model, right_known)?;
    let rel = initial_relative_pose(&left_poses, &right_poses)?;
    debug!(
        tx = rel.translation.x,
        ty = rel.translation.y,
        tz = rel.translation.z,
        "initial relative pose"
    );

    let mut params = Vec::with_capacity(VIEWS_OFFSET + POSE_PARAMS * n);
    params.extend_from_slice(&seeded_intrinsics(left_model, fix_intrinsics, options));
    params.extend_from_slice(&seeded_intrinsics(right_model, fix_intrinsics, options));
    params.extend_from_slice(&rel.to_params());
    for pose in &left_poses {
        params.extend_from_slice(&pose.to_params());
    }
    let mask = intrinsic_mask(fix_intrinsics, options);
    let mut free = Vec::with_capacity(params.len());
    free.extend_from_slice(&mask);
    free.extend_from_slice(&mask);
    free.resize(params.len(), true);

    let left_size = left_model.intrinsics.image_size();
    let right_size = right_model.intrinsics.image_size();
    let problem = StereoProblem {
        left: left_store.observations(),
        right: right_store.observations(),
        left_size,
        right_size,
    };
    let report = levenberg_marquardt(&problem, &mut params, &free, &options.solver)?;

    let left = model_from_params(&params[..INTRINSIC_PARAMS], left_size, None);
    let right = model_from_params(&params[INTRINSIC_PARAMS..REL_OFFSET], right_size, None);
    if !left.intrinsics.is_valid() || !right.intrinsics.is_valid() {
        return Err(CalibError::SolverDivergence(
            "stereo refinement produced an invalid camera matrix".to_string(),
        ));
    }
    let rel = Pose::from_params(&params[REL_OFFSET..VIEWS_OFFSET]);
    let left_extrinsics: Vec<Pose> = params[VIEWS_OFFSET..]
        .chunks_exact(POSE_PARAMS)
        .map(Pose::from_params)
        .collect();

    let point_count: usize = problem
        .left
        .iter()
        .chain(problem.right)
        .map(Observation::len)
        .sum();
    let rms = (report.final_cost / point_count as f64).sqrt();
    let pose = StereoPose::from_rigid(rel.rotation, rel.translation, &left, &right, rms);

    if pose.baseline < 1e-9 {
        warn!("stereo baseline is effectively zero");
    }
    info!(
        pairs = n,
        iterations = report.iterations,
        rms,
        baseline = pose.baseline,
        tx = pose.translation.x,
        ty = pose.translation.y,
        tz = pose.translation.z,
        fix_intrinsics,
        "stereo calibration solved"
    );

    Ok(StereoCalibration {
        left,
        right,
        pose,
        left_extrinsics,
        observation_count: n,
        pattern: *left_store.pattern(),
        fix_intrinsics,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use cv_core::rotation_angle_deg;

    #[test]
    fn recovers_rig_with_fixed_intrinsics() {
        let (ls, rs) = test_support::stereo_stores();
        let options = StereoCalibrationOptions::default();
        let calib = calibrate_stereo_from_models(
            &ls,
            &rs,
            &test_support::left_model(),
            &test_support::right_model(),
            true,
            &options,
        )
        .unwrap();

        let truth = test_support::relative_pose();
        assert!((calib.pose.translation - truth.translation).norm() < 1e-4);
        assert!(rotation_angle_deg(&(calib.pose.rotation * truth.rotation.transpose())) < 1e-4);
        assert!((calib.pose.baseline - 60.0).abs() < 1e-4);
        assert!(calib.pose.reprojection_error < 1e-6);
        assert_eq!(calib.left, test_support::left_model());
        assert_eq!(calib.left_extrinsics.len(), ls.len());
    }

    #[test]
    fn right_extrinsics_compose_relative_pose() {
        let (ls, rs) = test_support::stereo_stores();
        let calib = calibrate_stereo_from_models(
            &ls,
            &rs,
            &test_support::left_model(),
            &test_support::right_model(),
            true,
            &StereoCalibrationOptions::default(),
        )
        .unwrap();
        let truth_right: Vec<Pose> = test_support::board_poses(&test_support::pattern())
            .iter()
            .map(|p| test_support::relative_pose().compose(p))
            .collect();
        for (est, truth) in calib.right_extrinsics().iter().zip(&truth_right) {
            assert!((est.translation - truth.translation).norm() < 1e-3);
        }
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let (ls, _) = test_support::stereo_stores();
        let pattern = test_support::pattern();
        let short = test_support::store(
            &pattern,
            &test_support::right_model(),
            &test_support::board_poses(&pattern)[..3],
        );
        let err = calibrate_stereo_from_models(
            &ls,
            &short,
            &test_support::left_model(),
            &test_support::right_model(),
            true,
            &StereoCalibrationOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CalibError::SynchronizationMismatch { left: 7, right: 3 }
        ));
    }

    #[test]
    fn empty_stores_are_insufficient() {
        let pattern = test_support::pattern();
        let empty = ObservationStore::new(pattern);
        let err = calibrate_stereo_from_models(
            &empty,
            &empty,
            &test_support::left_model(),
            &test_support::right_model(),
            false,
            &StereoCalibrationOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CalibError::InsufficientObservations(_)));
    }

    #[test]
    fn relative_pose_average_is_exact_for_consistent_views() {
        let pattern = test_support::pattern();
        let rel = test_support::relative_pose();
        let left = test_support::board_poses(&pattern);
        let right: Vec<Pose> = left.iter().map(|p| rel.compose(p)).collect();
        let est = initial_relative_pose(&left, &right).unwrap();
        assert!((est.translation - rel.translation).norm() < 1e-9);
        assert!((est.rotation - rel.rotation).norm() < 1e-9);
    }
}
