use crate::{ImageSource, Result};
use image::GrayImage;
use std::collections::VecDeque;

/// Frames held in memory, handed out front to back.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    frames: VecDeque<GrayImage>,
}

impl MemorySource {
    pub fn new(frames: Vec<GrayImage>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    pub fn push(&mut self, frame: GrayImage) {
        self.frames.push_back(frame);
    }
}

impl ImageSource for MemorySource {
    fn next_frame(&mut self) -> Result<Option<GrayImage>> {
        Ok(self.frames.pop_front())
    }

    fn remaining_hint(&self) -> Option<usize> {
        Some(self.frames.len())
    }
}

impl FromIterator<GrayImage> for MemorySource {
    fn from_iter<I: IntoIterator<Item = GrayImage>>(iter: I) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}
