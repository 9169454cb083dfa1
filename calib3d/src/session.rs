//! Stateful calibration pipelines.
//!
//! A session owns its observation stores and walks
//! `Collecting -> ReadyForSolve -> Solving -> Solved | Failed`, with stereo
//! sessions ending in `Rectified`. Operations invoked in the wrong state fail
//! with `InvalidState` and leave the session untouched.

use std::fmt;

use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::calibration::{calibrate_mono_with_options, MonoCalibration, MonoCalibrationOptions};
use crate::chessboard::ChessboardDetector;
use crate::observation::{ObservationStore, StereoObservationStore};
use crate::pattern::CalibrationPattern;
use crate::persistence::{CalibrationRecord, MonoRecord, StereoRecord};
use crate::rectify::{rectify_with_options, RectificationSet, RectifyOptions};
use crate::stereo::{calibrate_stereo_with_options, StereoCalibration, StereoCalibrationOptions};
use crate::{CalibError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Collecting,
    ReadyForSolve,
    Solving,
    Solved,
    Failed,
    Rectified,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn collecting_state(observations: usize) -> PipelineState {
    ready_state(observations, true)
}

fn ready_state(observations: usize, sized: bool) -> PipelineState {
    if observations == 0 || !sized {
        PipelineState::Collecting
    } else {
        PipelineState::ReadyForSolve
    }
}

fn invalid_state(op: &str, state: PipelineState) -> CalibError {
    CalibError::InvalidState(format!("cannot {op} while {state}"))
}

/// Single-camera pipeline.
#[derive(Debug, Clone)]
pub struct MonoSession {
    store: ObservationStore,
    options: MonoCalibrationOptions,
    /// Resolution used when the store has not latched one.
    image_size: Option<(u32, u32)>,
    state: PipelineState,
    result: Option<MonoCalibration>,
    last_error: Option<String>,
}

impl MonoSession {
    pub fn new(pattern: CalibrationPattern) -> Self {
        Self::from_store(ObservationStore::new(pattern))
    }

    /// Wraps a prefilled store. A store of pushed observations has no
    /// resolution until one is given through [`MonoSession::with_image_size`],
    /// and the session stays `Collecting` until then.
    pub fn from_store(store: ObservationStore) -> Self {
        let mut session = Self {
            state: PipelineState::Collecting,
            store,
            options: MonoCalibrationOptions::default(),
            image_size: None,
            result: None,
            last_error: None,
        };
        session.state = session.pending_state();
        session
    }

    pub fn with_image_size(mut self, image_size: (u32, u32)) -> Self {
        self.image_size = Some(image_size);
        if matches!(self.state, PipelineState::Collecting | PipelineState::ReadyForSolve) {
            self.state = self.pending_state();
        }
        self
    }

    fn solve_size(&self) -> Option<(u32, u32)> {
        self.store.image_size().or(self.image_size)
    }

    fn pending_state(&self) -> PipelineState {
        ready_state(self.store.len(), self.solve_size().is_some())
    }

    pub fn with_options(mut self, options: MonoCalibrationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_detector(mut self, detector: ChessboardDetector) -> Self {
        self.store = self.store.with_detector(detector);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn store(&self) -> &ObservationStore {
        &self.store
    }

    pub fn result(&self) -> Option<&MonoCalibration> {
        self.result.as_ref()
    }

    /// Message of the most recent failed solve.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Adds one image; a new observation invalidates a previous result.
    pub fn add_image(&mut self, image: &GrayImage) -> bool {
        let added = self.store.add(image);
        if added {
            self.result = None;
            self.state = self.pending_state();
        }
        added
    }

    pub fn add_images(&mut self, images: &[GrayImage]) -> Vec<bool> {
        let added = self.store.add_batch(images);
        if added.iter().any(|a| *a) {
            self.result = None;
            self.state = self.pending_state();
        }
        added
    }

    /// Solves the current store. Re-running after `Solved` or `Failed`
    /// produces a fresh result.
    pub fn calibrate(&mut self) -> Result<&MonoCalibration> {
        let image_size = match (self.state, self.solve_size()) {
            (
                PipelineState::ReadyForSolve | PipelineState::Solved | PipelineState::Failed,
                Some(size),
            ) => size,
            (state, _) => return Err(invalid_state("calibrate", state)),
        };
        self.state = PipelineState::Solving;
        match calibrate_mono_with_options(&self.store, image_size, &self.options) {
            Ok(calib) => {
                self.state = PipelineState::Solved;
                self.last_error = None;
                Ok(self.result.insert(calib))
            }
            Err(e) => {
                warn!("mono calibration failed: {e}");
                self.state = PipelineState::Failed;
                self.result = None;
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn record(&self) -> Result<CalibrationRecord> {
        self.result
            .as_ref()
            .map(|c| MonoRecord::from_calibration(c).into())
            .ok_or_else(|| invalid_state("build a record", self.state))
    }
}

/// Per-camera branch of a stereo session.
#[derive(Debug, Clone)]
struct Branch {
    state: PipelineState,
    result: Option<MonoCalibration>,
}

impl Branch {
    fn new() -> Self {
        Self {
            state: PipelineState::Collecting,
            result: None,
        }
    }

    fn settle(&mut self, outcome: Result<MonoCalibration>, side: &str) -> Option<CalibError> {
        match outcome {
            Ok(calib) => {
                self.state = PipelineState::Solved;
                self.result = Some(calib);
                None
            }
            Err(e) => {
                warn!("{side} mono calibration failed: {e}");
                self.state = PipelineState::Failed;
                self.result = None;
                Some(e)
            }
        }
    }
}

/// Two-camera pipeline: collect synchronized pairs, solve each camera, solve
/// the rig, then rectify.
#[derive(Debug, Clone)]
pub struct StereoSession {
    stores: StereoObservationStore,
    mono_options: MonoCalibrationOptions,
    stereo_options: StereoCalibrationOptions,
    rectify_options: RectifyOptions,
    state: PipelineState,
    left: Branch,
    right: Branch,
    stereo: Option<StereoCalibration>,
    rectification: Option<RectificationSet>,
}

impl StereoSession {
    pub fn new(pattern: CalibrationPattern) -> Self {
        Self {
            stores: StereoObservationStore::new(pattern),
            mono_options: MonoCalibrationOptions::default(),
            stereo_options: StereoCalibrationOptions::default(),
            rectify_options: RectifyOptions::default(),
            state: PipelineState::Collecting,
            left: Branch::new(),
            right: Branch::new(),
            stereo: None,
            rectification: None,
        }
    }

    pub fn with_detector(mut self, detector: ChessboardDetector) -> Self {
        self.stores = self.stores.with_detector(detector);
        self
    }

    pub fn with_options(
        mut self,
        mono: MonoCalibrationOptions,
        stereo: StereoCalibrationOptions,
        rectify: RectifyOptions,
    ) -> Self {
        self.mono_options = mono;
        self.stereo_options = stereo;
        self.rectify_options = rectify;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn left_state(&self) -> PipelineState {
        self.left.state
    }

    pub fn right_state(&self) -> PipelineState {
        self.right.state
    }

    pub fn stores(&self) -> &StereoObservationStore {
        &self.stores
    }

    pub fn left_result(&self) -> Option<&MonoCalibration> {
        self.left.result.as_ref()
    }

    pub fn right_result(&self) -> Option<&MonoCalibration> {
        self.right.result.as_ref()
    }

    pub fn stereo_result(&self) -> Option<&StereoCalibration> {
        self.stereo.as_ref()
    }

    pub fn rectification(&self) -> Option<&RectificationSet> {
        self.rectification.as_ref()
    }

    /// Adds a synchronized pair; any new pair invalidates earlier results.
    pub fn add_pair(&mut self, left: &GrayImage, right: &GrayImage) -> Result<bool> {
        if self.state == PipelineState::Rectified {
            return Err(invalid_state("add pairs", self.state));
        }
        let added = self.stores.add_pair(left, right);
        if added {
            self.reset_results();
        }
        Ok(added)
    }

    fn reset_results(&mut self) {
        let ready = collecting_state(self.stores.len());
        self.state = ready;
        self.left = Branch {
            state: ready,
            result: None,
        };
        self.right = self.left.clone();
        self.stereo = None;
        self.rectification = None;
    }

    /// Solves both cameras independently (in parallel). Returns the first
    /// branch error; the other branch keeps its outcome.
    pub fn calibrate_mono(&mut self) -> Result<()> {
        let size = |s: &ObservationStore| s.image_size();
        let (Some(left_size), Some(right_size)) = (size(self.stores.left()), size(self.stores.right())) else {
            return Err(invalid_state("solve the cameras", self.state));
        };
        if self.state == PipelineState::Rectified || self.stores.is_empty() {
            return Err(invalid_state("solve the cameras", self.state));
        }
        self.left.state = PipelineState::Solving;
        self.right.state = PipelineState::Solving;
        let options = &self.mono_options;
        let (left, right) = rayon::join(
            || calibrate_mono_with_options(self.stores.left(), left_size, options),
            || calibrate_mono_with_options(self.stores.right(), right_size, options),
        );
        let left_err = self.left.settle(left, "left");
        let right_err = self.right.settle(right, "right");
        match left_err.or(right_err) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Solves the rig. Both cameras must be `Solved`.
    pub fn calibrate_stereo(&mut self, fix_intrinsics: bool) -> Result<&StereoCalibration> {
        let (Some(left), Some(right)) = (self.left.result.as_ref(), self.right.result.as_ref()) else {
            return Err(CalibError::InvalidState(format!(
                "stereo solve needs both cameras solved (left {}, right {})",
                self.left.state, self.right.state
            )));
        };
        if self.state == PipelineState::Rectified {
            return Err(invalid_state("re-solve the rig", self.state));
        }
        self.state = PipelineState::Solving;
        let outcome = calibrate_stereo_with_options(
            self.stores.left(),
            self.stores.right(),
            left,
            right,
            fix_intrinsics,
            &self.stereo_options,
        );
        match outcome {
            Ok(calib) => {
                self.state = PipelineState::Solved;
                Ok(self.stereo.insert(calib))
            }
            Err(e) => {
                warn!("stereo calibration failed: {e}");
                self.state = PipelineState::Failed;
                self.stereo = None;
                Err(e)
            }
        }
    }

    /// Rectifies the solved rig; the session is finished afterwards.
    pub fn rectify(&mut self) -> Result<&RectificationSet> {
        let Some(calib) = self.stereo.as_ref().filter(|_| self.state == PipelineState::Solved) else {
            return Err(invalid_state("rectify", self.state));
        };
        let set = rectify_with_options(&calib.left, &calib.right, &calib.pose, &self.rectify_options)?;
        self.state = PipelineState::Rectified;
        info!("stereo session rectified");
        Ok(self.rectification.insert(set))
    }

    /// Stereo record (with rectification once available).
    pub fn record(&self) -> Result<CalibrationRecord> {
        let calib = self
            .stereo
            .as_ref()
            .ok_or_else(|| invalid_state("build a stereo record", self.state))?;
        Ok(StereoRecord::from_calibration(calib, self.rectification.as_ref()).into())
    }

    /// Mono records of the two branches, when solved.
    pub fn mono_records(&self) -> (Option<MonoRecord>, Option<MonoRecord>) {
        (
            self.left.result.as_ref().map(MonoRecord::from_calibration),
            self.right.result.as_ref().map(MonoRecord::from_calibration),
        )
    }
}
