//! Error taxonomy for the preview pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PreviewError>;

/// Failures that can occur while processing a preview job.
///
/// An unsupported content type is not represented here: it is a normal
/// terminal outcome and surfaces as [`crate::job::PreviewResult::Unsupported`].
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("download failed: {0}")]
    Download(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("authentication failed: {0}")]
    Auth(&'static str),

    #[error("malformed queue message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("queue error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PreviewError {
    pub fn download(err: impl std::fmt::Display) -> Self {
        Self::Download(err.to_string())
    }

    pub fn conversion(err: impl std::fmt::Display) -> Self {
        Self::Conversion(err.to_string())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}
