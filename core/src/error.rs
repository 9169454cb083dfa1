use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the calibration pipeline.
///
/// Per-image failures (`PatternNotFound`, `UnreadableImage`) are reported so
/// callers can log and skip; the remaining variants are fatal to the call
/// that produced them.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("pattern not found: {0}")]
    PatternNotFound(String),

    #[error("unreadable image: {0}")]
    UnreadableImage(String),

    #[error("insufficient observations: {0}")]
    InsufficientObservations(String),

    #[error("solver diverged: {0}")]
    SolverDivergence(String),

    #[error("synchronization mismatch: left store has {left} observations, right store has {right}")]
    SynchronizationMismatch { left: usize, right: usize },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid pipeline state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// True for failures that only affect a single image and leave the run intact.
    pub fn is_per_image(&self) -> bool {
        matches!(self, Error::PatternNotFound(_) | Error::UnreadableImage(_))
    }
}
