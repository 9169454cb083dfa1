//! Camera calibration module
//!
//! Single-camera calibration from planar chessboard observations: a closed-form
//! homography estimate followed by Levenberg–Marquardt refinement of the
//! intrinsics, the Brown–Conrady distortion and one board pose per view.

use cv_core::{CameraModel, Pose};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::homography::{initial_intrinsics, observation_homography, pose_from_homography};
use crate::observation::{Observation, ObservationStore};
use crate::pattern::CalibrationPattern;
use crate::project::{intrinsic_params, model_from_params, write_residuals, INTRINSIC_PARAMS, POSE_PARAMS};
use crate::solver::{levenberg_marquardt, LeastSquaresProblem, LmOptions, LmReport};
use crate::{CalibError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonoCalibrationOptions {
    /// Enforce fx/fy to match this ratio (fx = ratio * fy).
    pub fix_aspect_ratio: Option<f64>,
    /// Keep the principal point at the image centre.
    pub fix_principal_point: bool,
    /// Fix tangential distortion coefficients (p1, p2) to zero
    pub zero_tangent_dist: bool,
    /// Fix radial distortion coefficient k1 to zero
    pub fix_k1: bool,
    /// Fix radial distortion coefficient k2 to zero
    pub fix_k2: bool,
    /// Fix radial distortion coefficient k3 to zero
    pub fix_k3: bool,
    pub solver: LmOptions,
}

impl Default for MonoCalibrationOptions {
    fn default() -> Self {
        Self {
            fix_aspect_ratio: None,
            fix_principal_point: false,
            zero_tangent_dist: false,
            fix_k1: false,
            fix_k2: false,
            fix_k3: false,
            solver: LmOptions::default(),
        }
    }
}

impl MonoCalibrationOptions {
    /// Free-parameter mask of the intrinsic block `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    fn intrinsic_mask(&self) -> [bool; INTRINSIC_PARAMS] {
        [
            true,
            self.fix_aspect_ratio.is_none(),
            !self.fix_principal_point,
            !self.fix_principal_point,
            !self.fix_k1,
            !self.fix_k2,
            !self.zero_tangent_dist,
            !self.zero_tangent_dist,
            !self.fix_k3,
        ]
    }
}

/// Solved single-camera model with the board pose of every observation.
#[derive(Debug, Clone)]
pub struct MonoCalibration {
    pub model: CameraModel,
    /// Board-to-camera pose per observation, index-aligned with the store.
    pub extrinsics: Vec<Pose>,
    /// RMS pixel distance between observed and reprojected corners.
    pub rms_reprojection_error: f64,
    pub observation_count: usize,
    pub pattern: CalibrationPattern,
    pub report: LmReport,
}

impl MonoCalibration {
    pub fn image_size(&self) -> (u32, u32) {
        self.model.intrinsics.image_size()
    }
}

/// Joint intrinsics + per-view pose problem; one residual block per view.
struct MonoProblem<'a> {
    observations: &'a [Observation],
    image_size: (u32, u32),
    aspect_ratio: Option<f64>,
}

impl LeastSquaresProblem for MonoProblem<'_> {
    fn num_params(&self) -> usize {
        INTRINSIC_PARAMS + POSE_PARAMS * self.observations.len()
    }

    fn num_blocks(&self) -> usize {
        self.observations.len()
    }

    fn block_len(&self, block: usize) -> usize {
        2 * self.observations[block].len()
    }

    fn block_residuals(&self, block: usize, params: &[f64], out: &mut [f64]) {
        let model = model_from_params(&params[..INTRINSIC_PARAMS], self.image_size, self.aspect_ratio);
        let start = INTRINSIC_PARAMS + POSE_PARAMS * block;
        let pose = Pose::from_params(&params[start..start + POSE_PARAMS]);
        write_residuals(&model, &pose, &self.observations[block], out);
    }

    fn touches(&self, param: usize, block: usize) -> bool {
        param < INTRINSIC_PARAMS || (param - INTRINSIC_PARAMS) / POSE_PARAMS == block
    }
}

/// Calibrate a camera from a store of chessboard observations with default options.
pub fn calibrate_mono(store: &ObservationStore, image_size: (u32, u32)) -> Result<MonoCalibration> {
    calibrate_mono_with_options(store, image_size, &MonoCalibrationOptions::default())
}

/// Calibrate a camera from a store of chessboard observations.
///
/// # Errors
/// * `InsufficientObservations` for an empty store
/// * `InvalidParameters` for a resolution that disagrees with the store or a degenerate view
/// * `SolverDivergence` when the refinement does not converge
pub fn calibrate_mono_with_options(
    store: &ObservationStore,
    image_size: (u32, u32),
    options: &MonoCalibrationOptions,
) -> Result<MonoCalibration> {
    if store.is_empty() {
        return Err(CalibError::InsufficientObservations(
            "mono calibration needs at least one observation".to_string(),
        ));
    }
    check_image_size(store, image_size)?;
    if let Some(ratio) = options.fix_aspect_ratio {
        if !(ratio.is_finite() && ratio > 0.0) {
            return Err(CalibError::InvalidParameters(format!(
                "aspect ratio must be positive, got {ratio}"
            )));
        }
    }

    let observations = store.observations();
    let homographies = observations
        .iter()
        .map(observation_homography)
        .collect::<Result<Vec<_>>>()?;

    let mut k0 = initial_intrinsics(&homographies, image_size);
    if options.fix_principal_point {
        k0.cx = image_size.0 as f64 / 2.0;
        k0.cy = image_size.1 as f64 / 2.0;
    }
    if let Some(ratio) = options.fix_aspect_ratio {
        k0.fy = k0.fx / ratio;
    }
    debug!(
        fx = k0.fx,
        fy = k0.fy,
        cx = k0.cx,
        cy = k0.cy,
        "closed-form initial intrinsics"
    );

    let k_inv = k0.inverse_matrix();
    let poses = homographies
        .iter()
        .map(|h| pose_from_homography(&k_inv, h))
        .collect::<Result<Vec<_>>>()?;

    let initial = CameraModel::new(k0, cv_core::Distortion::none());
    let mut params = intrinsic_params(&initial).to_vec();
    let mut free = options.intrinsic_mask().to_vec();
    for pose in &poses {
        params.extend_from_slice(&pose.to_params());
        free.extend_from_slice(&[true; POSE_PARAMS]);
    }

    let problem = MonoProblem {
        observations,
        image_size,
        aspect_ratio: options.fix_aspect_ratio,
    };
    let report = levenberg_marquardt(&problem, &mut params, &free, &options.solver)?;

    let model = model_from_params(&params[..INTRINSIC_PARAMS], image_size, options.fix_aspect_ratio);
    if !model.intrinsics.is_valid() {
        return Err(CalibError::SolverDivergence(format!(
            "solver produced an invalid camera matrix: {:?}",
            model.intrinsics
        )));
    }
    let extrinsics: Vec<Pose> = params[INTRINSIC_PARAMS..]
        .chunks_exact(POSE_PARAMS)
        .map(Pose::from_params)
        .collect();

    let point_count: usize = observations.iter().map(Observation::len).sum();
    let rms = (report.final_cost / point_count as f64).sqrt();
    info!(
        views = observations.len(),
        iterations = report.iterations,
        rms,
        fx = model.intrinsics.fx,
        fy = model.intrinsics.fy,
        cx = model.intrinsics.cx,
        cy = model.intrinsics.cy,
        "mono calibration solved"
    );

    Ok(MonoCalibration {
        model,
        extrinsics,
        rms_reprojection_error: rms,
        observation_count: observations.len(),
        pattern: *store.pattern(),
        report,
    })
}

fn check_image_size(store: &ObservationStore, image_size: (u32, u32)) -> Result<()> {
    if image_size.0 == 0 || image_size.1 == 0 {
        return Err(CalibError::InvalidParameters(format!(
            "image size must be non-zero, got {}x{}",
            image_size.0, image_size.1
        )));
    }
    match store.image_size() {
        Some(size) if size != image_size => Err(CalibError::InvalidParameters(format!(
            "store holds {}x{} observations, calibration asked for {}x{}",
            size.0, size.1, image_size.0, image_size.1
        ))),
        _ => Ok(()),
    }
}
