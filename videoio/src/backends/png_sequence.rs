use crate::{FrameWriter, Result, VideoError};
use image::GrayImage;
use std::fs;
use std::path::{Path, PathBuf};

/// Writes frames as `<prefix>_<index:06>.png`, readable back by
/// [`ImageSequence`](super::ImageSequence) in the same order.
#[derive(Debug)]
pub struct PngSequenceWriter {
    directory: PathBuf,
    prefix: String,
    frame_count: usize,
}

impl PngSequenceWriter {
    pub fn new(directory: &Path, prefix: &str) -> Result<Self> {
        if prefix.is_empty() || prefix.contains(['/', '\\']) {
            return Err(VideoError::InvalidParameters(format!(
                "invalid frame prefix {prefix:?}"
            )));
        }
        if !directory.exists() {
            fs::create_dir_all(directory)?;
        }

        Ok(Self {
            directory: directory.to_path_buf(),
            prefix: prefix.to_string(),
            frame_count: 0,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Path the next frame will be written to.
    pub fn next_path(&self) -> PathBuf {
        self.directory
            .join(format!("{}_{:06}.png", self.prefix, self.frame_count))
    }
}

impl FrameWriter for PngSequenceWriter {
    fn write(&mut self, frame: &GrayImage) -> Result<()> {
        let path = self.next_path();
        frame
            .save(&path)
            .map_err(|e| VideoError::Backend(format!("failed to save {}: {e}", path.display())))?;
        self.frame_count += 1;
        Ok(())
    }
}
