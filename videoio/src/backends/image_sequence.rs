use crate::{ImageSource, Result, VideoError};
use image::GrayImage;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Still images read in file-name order and converted to grayscale.
#[derive(Debug, Clone)]
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequence {
    /// All images with a known extension in `directory`, sorted by file name.
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        Self::open_with_extensions(directory, &DEFAULT_EXTENSIONS)
    }

    pub fn open_with_extensions<P: AsRef<Path>>(directory: P, extensions: &[&str]) -> Result<Self> {
        let directory = directory.as_ref();
        if !directory.is_dir() {
            return Err(VideoError::InvalidParameters(format!(
                "{} is not a directory",
                directory.display()
            )));
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(directory)? {
            let path = entry?.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)));
            if path.is_file() && matches {
                paths.push(path);
            }
        }
        paths.sort();
        debug!(directory = %directory.display(), frames = paths.len(), "opened image sequence");
        Ok(Self::from_paths(paths))
    }

    /// Frames in exactly the given order.
    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self { paths, next: 0 }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl ImageSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Option<GrayImage>> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        let index = self.next;
        self.next += 1;
        image::open(path)
            .map(|img| Some(img.into_luma8()))
            .map_err(|e| VideoError::Unreadable {
                index,
                reason: format!("{}: {e}", path.display()),
            })
    }

    fn remaining_hint(&self) -> Option<usize> {
        Some(self.paths.len() - self.next)
    }
}
