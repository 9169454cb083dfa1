//! Shared camera geometry and error types for the calibration crates.

pub mod error;
pub mod geometry;
pub mod runtime;

pub use error::{Error, Result};
pub use geometry::*;
pub use runtime::{current_cpu_threads, init_global_thread_pool};
