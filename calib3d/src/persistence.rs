//! Versioned JSON records of calibration results.
//!
//! Matrices are stored as nested row-major arrays. A record is tagged with its
//! kind (`"mono"` or `"stereo"`) and carries `schema_version`; records of any
//! other version are refused on load.

use std::fs;
use std::path::Path;

use cv_core::{CameraIntrinsics, CameraModel, Distortion};
use nalgebra::{Matrix3, SMatrix, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::calibration::MonoCalibration;
use crate::pattern::CalibrationPattern;
use crate::rectify::RectificationSet;
use crate::stereo::{StereoCalibration, StereoPose};
use crate::{CalibError, Result};

pub const SCHEMA_VERSION: u32 = 1;

type Rows3 = [[f64; 3]; 3];

fn to_rows<const R: usize, const C: usize>(m: &SMatrix<f64, R, C>) -> [[f64; C]; R] {
    let mut rows = [[0.0; C]; R];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = m[(r, c)];
        }
    }
    rows
}

fn from_rows<const R: usize, const C: usize>(rows: &[[f64; C]; R]) -> SMatrix<f64, R, C> {
    SMatrix::from_fn(|r, c| rows[r][c])
}

fn model_from_record(camera_matrix: &Rows3, distortion: &[f64; 5], image_size: [u32; 2]) -> CameraModel {
    CameraModel::new(
        CameraIntrinsics::from_matrix(&from_rows(camera_matrix), image_size[0], image_size[1]),
        Distortion::from_array(*distortion),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonoRecord {
    pub schema_version: u32,
    pub reprojection_error: f64,
    pub camera_matrix: Rows3,
    /// `[k1, k2, p1, p2, k3]`
    pub distortion_coefficients: [f64; 5],
    pub image_size: [u32; 2],
    /// `[cols, rows]`
    pub pattern_size: [usize; 2],
    pub square_size: f64,
    pub observation_count: usize,
}

impl MonoRecord {
    pub fn from_calibration(calib: &MonoCalibration) -> Self {
        let (w, h) = calib.image_size();
        let (cols, rows) = calib.pattern.pattern_size();
        Self {
            schema_version: SCHEMA_VERSION,
            reprojection_error: calib.rms_reprojection_error,
            camera_matrix: to_rows(&calib.model.intrinsics.matrix()),
            distortion_coefficients: calib.model.distortion.to_array(),
            image_size: [w, h],
            pattern_size: [cols, rows],
            square_size: calib.pattern.square_size(),
            observation_count: calib.observation_count,
        }
    }

    pub fn camera_model(&self) -> CameraModel {
        model_from_record(&self.camera_matrix, &self.distortion_coefficients, self.image_size)
    }

    pub fn pattern(&self) -> Result<CalibrationPattern> {
        CalibrationPattern::new(self.pattern_size[0], self.pattern_size[1], self.square_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoRecord {
    pub schema_version: u32,
    /// RMS over both cameras.
    pub reprojection_error: f64,
    /// Mirrors `camera_matrix_left`.
    pub camera_matrix: Rows3,
    /// Mirrors `distortion_left`.
    pub distortion_coefficients: [f64; 5],
    pub camera_matrix_left: Rows3,
    pub camera_matrix_right: Rows3,
    pub distortion_left: [f64; 5],
    pub distortion_right: [f64; 5],
    pub rotation_matrix: Rows3,
    pub translation_vector: [f64; 3],
    pub essential_matrix: Rows3,
    pub fundamental_matrix: Rows3,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rectification_left: Option<Rows3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rectification_right: Option<Rows3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection_left: Option<[[f64; 4]; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection_right: Option<[[f64; 4]; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disparity_to_depth_matrix: Option<[[f64; 4]; 4]>,
    /// In pattern units.
    pub baseline: f64,
    pub image_size: [u32; 2],
    pub pattern_size: [usize; 2],
    pub square_size: f64,
    pub observation_count: usize,
}

impl StereoRecord {
    pub fn from_calibration(calib: &StereoCalibration, rectification: Option<&RectificationSet>) -> Self {
        let (w, h) = calib.image_size();
        let (cols, rows) = calib.pattern.pattern_size();
        let left_k = to_rows(&calib.left.intrinsics.matrix());
        let left_d = calib.left.distortion.to_array();
        let t = &calib.pose.translation;
        Self {
            schema_version: SCHEMA_VERSION,
            reprojection_error: calib.pose.reprojection_error,
            camera_matrix: left_k,
            distortion_coefficients: left_d,
            camera_matrix_left: left_k,
            camera_matrix_right: to_rows(&calib.right.intrinsics.matrix()),
            distortion_left: left_d,
            distortion_right: calib.right.distortion.to_array(),
            rotation_matrix: to_rows(&calib.pose.rotation),
            translation_vector: [t.x, t.y, t.z],
            essential_matrix: to_rows(&calib.pose.essential_matrix),
            fundamental_matrix: to_rows(&calib.pose.fundamental_matrix),
            rectification_left: rectification.map(|r| to_rows(&r.r1)),
            rectification_right: rectification.map(|r| to_rows(&r.r2)),
            projection_left: rectification.map(|r| to_rows(&r.p1)),
            projection_right: rectification.map(|r| to_rows(&r.p2)),
            disparity_to_depth_matrix: rectification.map(|r| to_rows(&r.q)),
            baseline: calib.pose.baseline,
            image_size: [w, h],
            pattern_size: [cols, rows],
            square_size: calib.pattern.square_size(),
            observation_count: calib.observation_count,
        }
    }

    pub fn left_model(&self) -> CameraModel {
        model_from_record(&self.camera_matrix_left, &self.distortion_left, self.image_size)
    }

    pub fn right_model(&self) -> CameraModel {
        model_from_record(&self.camera_matrix_right, &self.distortion_right, self.image_size)
    }

    pub fn pose(&self) -> StereoPose {
        let t = self.translation_vector;
        StereoPose {
            rotation: from_rows(&self.rotation_matrix),
            translation: Vector3::new(t[0], t[1], t[2]),
            essential_matrix: from_rows(&self.essential_matrix),
            fundamental_matrix: from_rows(&self.fundamental_matrix),
            reprojection_error: self.reprojection_error,
            baseline: self.baseline,
        }
    }

    pub fn is_rectified(&self) -> bool {
        self.disparity_to_depth_matrix.is_some()
    }

    pub fn rectification_rotations(&self) -> Option<(Matrix3<f64>, Matrix3<f64>)> {
        Some((
            from_rows(self.rectification_left.as_ref()?),
            from_rows(self.rectification_right.as_ref()?),
        ))
    }

    pub fn pattern(&self) -> Result<CalibrationPattern> {
        CalibrationPattern::new(self.pattern_size[0], self.pattern_size[1], self.square_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationRecord {
    Mono(MonoRecord),
    Stereo(StereoRecord),
}

impl From<MonoRecord> for CalibrationRecord {
    fn from(record: MonoRecord) -> Self {
        Self::Mono(record)
    }
}

impl From<StereoRecord> for CalibrationRecord {
    fn from(record: StereoRecord) -> Self {
        Self::Stereo(record)
    }
}

impl CalibrationRecord {
    pub fn schema_version(&self) -> u32 {
        match self {
            Self::Mono(r) => r.schema_version,
            Self::Stereo(r) => r.schema_version,
        }
    }

    pub fn reprojection_error(&self) -> f64 {
        match self {
            Self::Mono(r) => r.reprojection_error,
            Self::Stereo(r) => r.reprojection_error,
        }
    }

    pub fn as_mono(&self) -> Option<&MonoRecord> {
        match self {
            Self::Mono(r) => Some(r),
            Self::Stereo(_) => None,
        }
    }

    pub fn as_stereo(&self) -> Option<&StereoRecord> {
        match self {
            Self::Stereo(r) => Some(r),
            Self::Mono(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CalibError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let record: Self =
            serde_json::from_str(json).map_err(|e| CalibError::Serialization(e.to_string()))?;
        if record.schema_version() != SCHEMA_VERSION {
            return Err(CalibError::Serialization(format!(
                "unsupported schema version {} (expected {SCHEMA_VERSION})",
                record.schema_version()
            )));
        }
        Ok(record)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?)?;
        info!("calibration record written to {}", path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let record = Self::from_json(&json)?;
        debug!("calibration record loaded from {}", path.display());
        Ok(record)
    }
}
