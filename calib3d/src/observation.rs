//! Caller-owned accumulation of corner observations.

use image::GrayImage;
use nalgebra::{Point2, Point3};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::chessboard::ChessboardDetector;
use crate::pattern::CalibrationPattern;
use crate::{CalibError, Result};

/// Matched board points and image corners of one view, index for index.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    world_points: Vec<Point3<f64>>,
    image_points: Vec<Point2<f64>>,
}

impl Observation {
    pub fn new(world_points: Vec<Point3<f64>>, image_points: Vec<Point2<f64>>) -> Result<Self> {
        if world_points.len() != image_points.len() || world_points.is_empty() {
            return Err(CalibError::InvalidParameters(format!(
                "observation needs matching non-empty point sets, got {} world and {} image points",
                world_points.len(),
                image_points.len()
            )));
        }
        Ok(Self {
            world_points,
            image_points,
        })
    }

    pub fn world_points(&self) -> &[Point3<f64>] {
        &self.world_points
    }

    pub fn image_points(&self) -> &[Point2<f64>] {
        &self.image_points
    }

    pub fn len(&self) -> usize {
        self.world_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.world_points.is_empty()
    }
}

/// Ordered observations of one camera for a single pattern and resolution.
///
/// The resolution is either fixed at construction or taken from the first
/// image that contributes; images of any other size are skipped.
#[derive(Debug, Clone)]
pub struct ObservationStore {
    pattern: CalibrationPattern,
    image_size: Option<(u32, u32)>,
    detector: ChessboardDetector,
    observations: Vec<Observation>,
}

impl ObservationStore {
    pub fn new(pattern: CalibrationPattern) -> Self {
        Self {
            pattern,
            image_size: None,
            detector: ChessboardDetector::default(),
            observations: Vec::new(),
        }
    }

    pub fn with_image_size(pattern: CalibrationPattern, image_size: (u32, u32)) -> Self {
        Self {
            image_size: Some(image_size),
            ..Self::new(pattern)
        }
    }

    pub fn with_detector(mut self, detector: ChessboardDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn pattern(&self) -> &CalibrationPattern {
        &self.pattern
    }

    pub fn image_size(&self) -> Option<(u32, u32)> {
        self.image_size
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Detects the pattern in `image` and appends an observation on success.
    /// Returns whether the image contributed.
    pub fn add(&mut self, image: &GrayImage) -> bool {
        match self.detect(image) {
            Some(corners) => {
                self.commit(image.dimensions(), corners);
                true
            }
            None => false,
        }
    }

    /// Runs detection on all images in parallel and appends the successful
    /// ones in input order.
    pub fn add_batch(&mut self, images: &[GrayImage]) -> Vec<bool> {
        let detections: Vec<(usize, Option<Vec<Point2<f64>>>)> = images
            .par_iter()
            .enumerate()
            .map(|(i, image)| (i, self.detect(image)))
            .collect();
        self.merge(images.iter().map(|i| i.dimensions()).collect(), detections)
    }

    /// Appends an externally produced observation. Its point count must match the pattern.
    pub fn push(&mut self, observation: Observation) -> Result<()> {
        if observation.len() != self.pattern.corner_count() {
            return Err(CalibError::InvalidParameters(format!(
                "observation has {} points, pattern has {}",
                observation.len(),
                self.pattern.corner_count()
            )));
        }
        self.observations.push(observation);
        Ok(())
    }

    pub fn object_points(&self) -> Vec<Vec<Point3<f64>>> {
        self.observations
            .iter()
            .map(|o| o.world_points.clone())
            .collect()
    }

    pub fn image_points(&self) -> Vec<Vec<Point2<f64>>> {
        self.observations
            .iter()
            .map(|o| o.image_points.clone())
            .collect()
    }

    fn detect(&self, image: &GrayImage) -> Option<Vec<Point2<f64>>> {
        if let Some(size) = self.image_size {
            if image.dimensions() != size {
                warn!(
                    "skipping {}x{} image, store expects {}x{}",
                    image.width(),
                    image.height(),
                    size.0,
                    size.1
                );
                return None;
            }
        }
        let detection = self.detector.detect(image, &self.pattern);
        if !detection.found {
            debug!("pattern not found in {}x{} image", image.width(), image.height());
            return None;
        }
        Some(detection.corners)
    }

    fn accepts(&self, size: (u32, u32)) -> bool {
        self.image_size.map_or(true, |s| s == size)
    }

    fn commit(&mut self, size: (u32, u32), corners: Vec<Point2<f64>>) {
        self.image_size.get_or_insert(size);
        self.observations.push(Observation {
            world_points: self.pattern.world_points(),
            image_points: corners,
        });
    }

    /// Appends index-tagged detections in index order.
    fn merge(
        &mut self,
        sizes: Vec<(u32, u32)>,
        mut detections: Vec<(usize, Option<Vec<Point2<f64>>>)>,
    ) -> Vec<bool> {
        detections.sort_by_key(|(i, _)| *i);
        detections
            .into_iter()
            .map(|(i, corners)| match corners {
                Some(c) if self.accepts(sizes[i]) => {
                    self.commit(sizes[i], c);
                    true
                }
                _ => false,
            })
            .collect()
    }
}

/// Left and right stores kept index-aligned: entry `i` of both comes from the
/// same synchronized capture.
#[derive(Debug, Clone)]
pub struct StereoObservationStore {
    left: ObservationStore,
    right: ObservationStore,
}

impl StereoObservationStore {
    pub fn new(pattern: CalibrationPattern) -> Self {
        Self {
            left: ObservationStore::new(pattern),
            right: ObservationStore::new(pattern),
        }
    }

    pub fn with_detector(self, detector: ChessboardDetector) -> Self {
        Self {
            left: self.left.with_detector(detector.clone()),
            right: self.right.with_detector(detector),
        }
    }

    pub fn left(&self) -> &ObservationStore {
        &self.left
    }

    pub fn right(&self) -> &ObservationStore {
        &self.right
    }

    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub fn into_parts(self) -> (ObservationStore, ObservationStore) {
        (self.left, self.right)
    }

    /// Appends to both stores only when the pattern is found in both images.
    pub fn add_pair(&mut self, left: &GrayImage, right: &GrayImage) -> bool {
        let (l, r) = rayon::join(|| self.left.detect(left), || self.right.detect(right));
        self.commit_pair(left.dimensions(), right.dimensions(), l, r)
    }

    /// Parallel [`StereoObservationStore::add_pair`] over a batch, appended in input order.
    pub fn add_pairs(&mut self, pairs: &[(GrayImage, GrayImage)]) -> Vec<bool> {
        let mut detections: Vec<(usize, Option<Vec<Point2<f64>>>, Option<Vec<Point2<f64>>>)> =
            pairs
                .par_iter()
                .enumerate()
                .map(|(i, (l, r))| (i, self.left.detect(l), self.right.detect(r)))
                .collect();
        detections.sort_by_key(|(i, _, _)| *i);
        detections
            .into_iter()
            .map(|(i, l, r)| {
                let (li, ri) = &pairs[i];
                self.commit_pair(li.dimensions(), ri.dimensions(), l, r)
            })
            .collect()
    }

    fn commit_pair(
        &mut self,
        left_size: (u32, u32),
        right_size: (u32, u32),
        left: Option<Vec<Point2<f64>>>,
        right: Option<Vec<Point2<f64>>>,
    ) -> bool {
        match (left, right) {
            (Some(l), Some(r)) if self.left.accepts(left_size) && self.right.accepts(right_size) => {
                self.left.commit(left_size, l);
                self.right.commit(right_size, r);
                true
            }
            (Some(_), None) | (None, Some(_)) => {
                debug!("discarding one-sided detection to keep stereo stores aligned");
                false
            }
            _ => false,
        }
    }
}
