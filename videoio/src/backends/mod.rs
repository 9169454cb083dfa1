//! Image source and writer backends

pub mod image_sequence;
pub mod memory;
pub mod png_sequence;

pub use image_sequence::ImageSequence;
pub use memory::MemorySource;
pub use png_sequence::PngSequenceWriter;
