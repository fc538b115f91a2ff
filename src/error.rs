//! Error taxonomy for the processing core.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),

    #[error("invalid FOV range [{start}, {end}] for {n_fovs} FOVs")]
    InvalidRange {
        start: i64,
        end: i64,
        n_fovs: usize,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("numeric failure: {0}")]
    NumericFailure(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<zarrs::array::ArrayCreateError> for PipelineError {
    fn from(e: zarrs::array::ArrayCreateError) -> Self {
        PipelineError::IoFailure(std::io::Error::other(e.to_string()))
    }
}

impl From<zarrs::array::ArrayError> for PipelineError {
    fn from(e: zarrs::array::ArrayError) -> Self {
        PipelineError::IoFailure(std::io::Error::other(e.to_string()))
    }
}

impl From<zarrs::storage::StorageError> for PipelineError {
    fn from(e: zarrs::storage::StorageError) -> Self {
        PipelineError::IoFailure(std::io::Error::other(e.to_string()))
    }
}

impl From<zarrs::group::GroupCreateError> for PipelineError {
    fn from(e: zarrs::group::GroupCreateError) -> Self {
        PipelineError::IoFailure(std::io::Error::other(e.to_string()))
    }
}

impl From<zarrs::filesystem::FilesystemStoreCreateError> for PipelineError {
    fn from(e: zarrs::filesystem::FilesystemStoreCreateError) -> Self {
        PipelineError::IoFailure(std::io::Error::other(e.to_string()))
    }
}
