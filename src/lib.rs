//! Planar camera calibration.
//!
//! Re-exports the calibration crates under one roof and adds the glue that
//! feeds an [`ImageSource`](cv_videoio::ImageSource) into observation stores.

pub use cv_calib3d as calib3d;
pub use cv_core as core;
pub use cv_videoio as videoio;

pub mod acquisition;

pub use acquisition::{collect_mono, collect_stereo, AcquisitionReport};

/// Initialize a single global Rayon thread pool for all CPU-parallel routines.
///
/// Call this once at application startup before detecting corners in bulk.
/// Returns the worker count; repeated calls return the first outcome.
/// `num_threads` overrides the `CV_CALIB_THREADS` env var.
pub fn init_thread_pool(num_threads: Option<usize>) -> Result<usize, String> {
    cv_core::init_global_thread_pool(num_threads)
}
