use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the synchronization core and its collaborators.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("timestep {timestep} out of range for a schedule of {num_train_timesteps} steps")]
    TimestepOutOfRange {
        timestep: usize,
        num_train_timesteps: usize,
    },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("expected one estimate per view ({views}), got {estimates}")]
    ViewCountMismatch { views: usize, estimates: usize },

    #[error("invalid view: {0}")]
    InvalidView(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error(
        "results already exist in {0}; pass --save-dir-now to write into a timestamped directory"
    )]
    OutputDirectoryExists(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
