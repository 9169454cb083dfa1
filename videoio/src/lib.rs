//! Ordered image sources for calibration pipelines
//!
//! A calibration run consumes frames in a fixed order: a directory of still
//! images, an in-memory list, or anything else that can hand out grayscale
//! frames one at a time. Decoding failures are reported per frame so that a
//! single corrupt file never aborts a run.

use image::GrayImage;
use std::fmt::Debug;

pub type Result<T> = std::result::Result<T, VideoError>;

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame {index} unreadable: {reason}")]
    Unreadable { index: usize, reason: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Ordered, finite stream of grayscale frames.
///
/// `Ok(None)` marks the end of the stream. `Err(VideoError::Unreadable)` skips
/// exactly one frame; the next call continues with the following one.
pub trait ImageSource: Send + Debug {
    fn next_frame(&mut self) -> Result<Option<GrayImage>>;

    /// Number of frames still to come, when known.
    fn remaining_hint(&self) -> Option<usize> {
        None
    }
}

impl<S: ImageSource + ?Sized> ImageSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<GrayImage>> {
        (**self).next_frame()
    }

    fn remaining_hint(&self) -> Option<usize> {
        (**self).remaining_hint()
    }
}

/// Sink for frames, e.g. rendered boards or rectified pairs.
pub trait FrameWriter: Send + Debug {
    fn write(&mut self, frame: &GrayImage) -> Result<()>;
}

pub mod backends;

pub use backends::{ImageSequence, MemorySource, PngSequenceWriter};

/// Open a directory of still images (png, jpg, jpeg, bmp), sorted by file name.
pub fn open_sequence<P: AsRef<std::path::Path>>(directory: P) -> Result<Box<dyn ImageSource>> {
    Ok(Box::new(ImageSequence::open(directory)?))
}
