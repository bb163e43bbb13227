//! Error types for the recognition pipeline

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaceError {
    #[error("model directory not found: {0}")]
    ModelDirectoryNotFound(PathBuf),

    #[error("model file not found: {0}")]
    ModelFileNotFound(PathBuf),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("image buffer holds {actual} bytes, expected {expected}")]
    InvalidImageBuffer { expected: usize, actual: usize },

    #[error(
        "image at index {index} is {}x{}, but the batch requires {}x{}",
        actual.0, actual.1, expected.0, expected.1
    )]
    BatchDimensionMismatch {
        index: usize,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("landmark set {index} has {count} points; only 68 or 5 point shapes can be aligned")]
    InvalidLandmarkCount { index: usize, count: usize },

    #[error("face encoding must have 128 values, got {0}")]
    InvalidEncodingLength(usize),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} is not configured")]
    EstimatorNotConfigured(&'static str),

    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("search index has not been built")]
    IndexNotBuilt,

    #[error("search index has already been built")]
    IndexAlreadyBuilt,

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FaceError {
    /// Wrap an error raised by the inference runtime.
    pub fn inference(err: impl std::fmt::Display) -> Self {
        FaceError::Inference(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FaceError>;
