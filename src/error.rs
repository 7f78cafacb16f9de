//! Error types for the download engine.
use crate::planner::ByteRange;
use crate::state::DownloadStatus;
use std::io;
use thiserror::Error;

/// Boxed cause carried by transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// The probe response had no usable `Content-Length`.
    #[error("Content Length not found in response header.")]
    LengthUnavailable,

    #[error("metadata probe failed: {0}")]
    ProbeFailed(#[source] BoxError),

    #[error("fetching bytes {range} failed: {source}")]
    FetchFailed {
        range: ByteRange,
        #[source]
        source: BoxError,
    },

    #[error("write failed: {0}")]
    WriteFailed(#[from] io::Error),

    /// `start()` was called while a probe or fetch loop was still active.
    #[error("download already active (status: {0})")]
    AlreadyActive(DownloadStatus),
}

impl DownloadError {
    pub fn probe(cause: impl Into<BoxError>) -> Self {
        DownloadError::ProbeFailed(cause.into())
    }

    pub fn fetch(range: ByteRange, cause: impl Into<BoxError>) -> Self {
        DownloadError::FetchFailed {
            range,
            source: cause.into(),
        }
    }
}

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;
