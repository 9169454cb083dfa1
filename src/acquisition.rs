//! Driving image sources into observation stores.

use cv_calib3d::{ObservationStore, StereoObservationStore};
use cv_videoio::{ImageSource, Result, VideoError};
use image::GrayImage;
use tracing::{debug, info, warn};

/// Frames decoded before detection runs over them in parallel.
const BATCH: usize = 16;

/// Outcome of one acquisition run. Frame indices are positions in the source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub total: usize,
    /// Frames (or pairs) that contributed an observation.
    pub used: Vec<usize>,
    /// Frames decoded fine but without a complete pattern.
    pub rejected: Vec<usize>,
    pub unreadable: Vec<usize>,
}

impl AcquisitionReport {
    fn merge_batch(&mut self, indices: &[usize], added: &[bool]) {
        for (&index, &ok) in indices.iter().zip(added) {
            if ok {
                self.used.push(index);
            } else {
                debug!(frame = index, "pattern not found");
                self.rejected.push(index);
            }
        }
    }
}

/// Read `source` to the end, adding every frame with a complete pattern to `store`.
///
/// Unreadable frames are recorded and skipped; any other source error aborts.
pub fn collect_mono<S: ImageSource + ?Sized>(
    source: &mut S,
    store: &mut ObservationStore,
) -> Result<AcquisitionReport> {
    let mut report = AcquisitionReport::default();
    let mut frames = Vec::with_capacity(BATCH);
    let mut indices = Vec::with_capacity(BATCH);

    loop {
        let index = report.total;
        match source.next_frame() {
            Ok(Some(frame)) => {
                report.total += 1;
                frames.push(frame);
                indices.push(index);
            }
            Ok(None) => break,
            Err(VideoError::Unreadable { index: _, reason }) => {
                report.total += 1;
                warn!(frame = index, %reason, "skipping unreadable frame");
                report.unreadable.push(index);
            }
            Err(e) => return Err(e),
        }
        if frames.len() == BATCH {
            let added = store.add_batch(&frames);
            report.merge_batch(&indices, &added);
            frames.clear();
            indices.clear();
        }
    }
    if !frames.is_empty() {
        let added = store.add_batch(&frames);
        report.merge_batch(&indices, &added);
    }

    info!(
        total = report.total,
        used = report.used.len(),
        rejected = report.rejected.len(),
        unreadable = report.unreadable.len(),
        "mono acquisition finished"
    );
    Ok(report)
}

fn read_side<S: ImageSource + ?Sized>(source: &mut S, side: &str, index: usize) -> Result<Option<Option<GrayImage>>> {
    match source.next_frame() {
        Ok(Some(frame)) => Ok(Some(Some(frame))),
        Ok(None) => Ok(None),
        Err(VideoError::Unreadable { reason, .. }) => {
            warn!(pair = index, side, %reason, "skipping unreadable frame");
            Ok(Some(None))
        }
        Err(e) => Err(e),
    }
}

/// Read both sources in lockstep until either ends, adding pairs where both
/// views show the complete pattern. A pair with an unreadable side counts as
/// unreadable.
pub fn collect_stereo<L, R>(
    left: &mut L,
    right: &mut R,
    store: &mut StereoObservationStore,
) -> Result<AcquisitionReport>
where
    L: ImageSource + ?Sized,
    R: ImageSource + ?Sized,
{
    let mut report = AcquisitionReport::default();
    let mut pairs = Vec::with_capacity(BATCH);
    let mut indices = Vec::with_capacity(BATCH);

    loop {
        let index = report.total;
        let l = read_side(left, "left", index)?;
        let r = read_side(right, "right", index)?;
        let (l, r) = match (l, r) {
            (Some(l), Some(r)) => (l, r),
            (None, None) => break,
            (None, Some(_)) | (Some(_), None) => {
                warn!(pair = index, "sources ended at different lengths; stopping at the shorter one");
                break;
            }
        };
        report.total += 1;
        match (l, r) {
            (Some(l), Some(r)) => {
                pairs.push((l, r));
                indices.push(index);
            }
            _ => report.unreadable.push(index),
        }
        if pairs.len() == BATCH {
            let added = store.add_pairs(&pairs);
            report.merge_batch(&indices, &added);
            pairs.clear();
            indices.clear();
        }
    }
    if !pairs.is_empty() {
        let added = store.add_pairs(&pairs);
        report.merge_batch(&indices, &added);
    }

    info!(
        total = report.total,
        used = report.used.len(),
        rejected = report.rejected.len(),
        unreadable = report.unreadable.len(),
        "stereo acquisition finished"
    );
    Ok(report)
}
