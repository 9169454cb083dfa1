//! Reprojection-error statistics for solved or loaded calibrations.

use std::fmt;

use cv_core::{CameraModel, Pose};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::calibration::MonoCalibration;
use crate::homography::estimate_planar_pose;
use crate::observation::{Observation, ObservationStore};
use crate::persistence::{MonoRecord, StereoRecord};
use crate::project::{reprojection_distances, write_residuals, POSE_PARAMS};
use crate::solver::{levenberg_marquardt, LeastSquaresProblem, LmOptions};
use crate::stereo::StereoCalibration;
use crate::{CalibError, Result};

/// Rough quality of an RMS reprojection error. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityBand {
    Excellent,
    Good,
    Acceptable,
    Poor,
}

impl QualityBand {
    pub fn from_rms(rms: f64) -> Self {
        if rms < 0.5 {
            Self::Excellent
        } else if rms < 1.0 {
            Self::Good
        } else if rms < 2.0 {
            Self::Acceptable
        } else {
            Self::Poor
        }
    }
}

impl fmt::Display for QualityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Acceptable => "acceptable",
            Self::Poor => "poor",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// RMS pixel error of each observation, in store order.
    pub per_observation_error: Vec<f64>,
    pub rms_error: f64,
    /// Largest single-corner error.
    pub max_error: f64,
    pub quality: QualityBand,
}

impl ValidationReport {
    fn from_distances(per_view: &[Vec<f64>]) -> Self {
        let mut sum_sq = 0.0;
        let mut count = 0usize;
        let mut max_error: f64 = 0.0;
        let per_observation_error = per_view
            .iter()
            .map(|d| {
                let sq: f64 = d.iter().map(|e| e * e).sum();
                sum_sq += sq;
                count += d.len();
                max_error = d.iter().copied().fold(max_error, f64::max);
                (sq / d.len().max(1) as f64).sqrt()
            })
            .collect();
        let rms_error = (sum_sq / count.max(1) as f64).sqrt();
        Self {
            per_observation_error,
            rms_error,
            max_error,
            quality: QualityBand::from_rms(rms_error),
        }
    }

    /// Indices of observations whose RMS exceeds `threshold` pixels.
    pub fn outliers(&self, threshold: f64) -> Vec<usize> {
        self.per_observation_error
            .iter()
            .enumerate()
            .filter(|(_, e)| **e > threshold)
            .map(|(i, _)| i)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoValidationReport {
    pub left: ValidationReport,
    pub right: ValidationReport,
    /// RMS over the corners of both cameras.
    pub combined_rms: f64,
    pub quality: QualityBand,
}

fn evaluate(model: &CameraModel, poses: &[Pose], observations: &[Observation]) -> ValidationReport {
    let per_view: Vec<Vec<f64>> = poses
        .iter()
        .zip(observations)
        .map(|(pose, obs)| reprojection_distances(model, pose, obs))
        .collect();
    ValidationReport::from_distances(&per_view)
}

fn require_observations(store: &ObservationStore) -> Result<()> {
    if store.is_empty() {
        return Err(CalibError::InsufficientObservations(
            "validation needs at least one observation".to_string(),
        ));
    }
    Ok(())
}

/// Reprojection statistics of a mono solution over the store it was solved from.
pub fn validate_mono(calib: &MonoCalibration, store: &ObservationStore) -> Result<ValidationReport> {
    require_observations(store)?;
    if calib.extrinsics.len() != store.len() {
        return Err(CalibError::InvalidParameters(format!(
            "calibration has {} poses, store has {} observations",
            calib.extrinsics.len(),
            store.len()
        )));
    }
    let report = evaluate(&calib.model, &calib.extrinsics, store.observations());
    debug!(rms = report.rms_error, max = report.max_error, "mono validation");
    Ok(report)
}

pub fn validate_stereo(
    calib: &StereoCalibration,
    left: &ObservationStore,
    right: &ObservationStore,
) -> Result<StereoValidationReport> {
    if left.len() != right.len() {
        return Err(CalibError::SynchronizationMismatch {
            left: left.len(),
            right: right.len(),
        });
    }
    require_observations(left)?;
    if calib.left_extrinsics.len() != left.len() {
        return Err(CalibError::InvalidParameters(format!(
            "calibration has {} poses, stores have {} pairs",
            calib.left_extrinsics.len(),
            left.len()
        )));
    }
    let left_report = evaluate(&calib.left, &calib.left_extrinsics, left.observations());
    let right_report = evaluate(&calib.right, &calib.right_extrinsics(), right.observations());

    let points = |s: &ObservationStore| s.observations().iter().map(Observation::len).sum::<usize>() as f64;
    let (nl, nr) = (points(left), points(right));
    let combined_rms = ((left_report.rms_error.powi(2) * nl + right_report.rms_error.powi(2) * nr)
        / (nl + nr))
        .sqrt();
    Ok(StereoValidationReport {
        left: left_report,
        right: right_report,
        combined_rms,
        quality: QualityBand::from_rms(combined_rms),
    })
}

/// Single-view pose refinement under a fixed camera model.
struct PoseProblem<'a> {
    model: &'a CameraModel,
    observation: &'a Observation,
}

impl LeastSquaresProblem for PoseProblem<'_> {
    fn num_params(&self) -> usize {
        POSE_PARAMS
    }

    fn num_blocks(&self) -> usize {
        1
    }

    fn block_len(&self, _block: usize) -> usize {
        2 * self.observation.len()
    }

    fn block_residuals(&self, _block: usize, params: &[f64], out: &mut [f64]) {
        write_residuals(self.model, &Pose::from_params(params), self.observation, out);
    }
}

/// Reprojection statistics of a fixed model (e.g. loaded from disk) on new observations.
///
/// Each view's board pose is estimated from its homography and refined with
/// the model held constant.
pub fn validate_model(model: &CameraModel, store: &ObservationStore) -> Result<ValidationReport> {
    require_observations(store)?;
    if let Some(size) = store.image_size() {
        if size != model.intrinsics.image_size() {
            return Err(CalibError::InvalidParameters(format!(
                "store holds {}x{} images, camera model is {}x{}",
                size.0,
                size.1,
                model.intrinsics.width,
                model.intrinsics.height
            )));
        }
    }
    let poses = store
        .observations()
        .iter()
        .map(|obs| {
            let mut params = estimate_planar_pose(model, obs)?.to_params();
            let problem = PoseProblem {
                model,
                observation: obs,
            };
            levenberg_marquardt(&problem, &mut params, &[true; POSE_PARAMS], &LmOptions::default())?;
            Ok(Pose::from_params(&params))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(evaluate(model, &poses, store.observations()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetterCalibration {
    Mono,
    Stereo,
}

/// Side-by-side summary of a mono and an optional stereo record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationComparison {
    pub mono_error: f64,
    pub mono_observations: usize,
    /// Mean of fx and fy of the mono camera.
    pub mono_focal: f64,
    pub stereo_error: Option<f64>,
    pub stereo_observations: Option<usize>,
    pub baseline: Option<f64>,
    pub better: Option<BetterCalibration>,
    pub warnings: Vec<String>,
}

/// Baselines below this many millimetres give poor depth resolution.
pub const MIN_BASELINE_MM: f64 = 50.0;

/// Compare a mono record with an optional stereo record. `unit_mm` states
/// whether the pattern square size is in millimetres, which enables the
/// small-baseline warning.
pub fn compare_calibrations(
    mono: &MonoRecord,
    stereo: Option<&StereoRecord>,
    unit_mm: bool,
) -> CalibrationComparison {
    let k = mono.camera_model().intrinsics;
    let mut comparison = CalibrationComparison {
        mono_error: mono.reprojection_error,
        mono_observations: mono.observation_count,
        mono_focal: (k.fx + k.fy) / 2.0,
        stereo_error: None,
        stereo_observations: None,
        baseline: None,
        better: None,
        warnings: Vec::new(),
    };
    let Some(stereo) = stereo else {
        return comparison;
    };

    comparison.stereo_error = Some(stereo.reprojection_error);
    comparison.stereo_observations = Some(stereo.observation_count);
    comparison.baseline = Some(stereo.baseline);
    comparison.better = Some(if stereo.reprojection_error < mono.reprojection_error {
        BetterCalibration::Stereo
    } else {
        BetterCalibration::Mono
    });
    if unit_mm && stereo.baseline <= MIN_BASELINE_MM {
        let msg = format!(
            "small baseline ({:.1} mm), consider a wider camera separation",
            stereo.baseline
        );
        warn!("{msg}");
        comparison.warnings.push(msg);
    }
    if QualityBand::from_rms(stereo.reprojection_error) == QualityBand::Poor {
        comparison
            .warnings
            .push(format!("stereo reprojection error {:.3} px is poor", stereo.reprojection_error));
    }
    comparison
}
