//! Error taxonomy for the segmented download engine (spec §7).
//!
//! One `thiserror` enum end to end: lower-level errors (curl, `std::io`,
//! `sqlx`) are converted into the matching variant at the boundary where
//! they're first observed, rather than leaking upward.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid total size")]
    InvalidSize,

    #[error("server does not support range requests")]
    RangeNotSupported,

    #[error("breaker open for this endpoint")]
    BreakerOpen,

    #[error("unexpected HTTP status {code}")]
    HttpStatus { code: u32 },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("segment ended with {received} of {expected} bytes")]
    IncompleteSegment { expected: u64, received: u64 },

    #[error("file I/O error during {op} on {}: {source}", path.display())]
    FileIO {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("merged file size {actual} does not match expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Internal cancellation signal. Never surfaced to the host; a cancelled
    /// Download reports as `DownloadState::Cancelled`, not as this error.
    #[error("aborted")]
    Aborted,

    #[error("persistence error: {0}")]
    Store(String),
}

impl DownloadError {
    /// Per §7: transport-class failures that the Coordinator retries up to
    /// `retry_max` with exponential backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::HttpStatus { .. }
                | DownloadError::Network(_)
                | DownloadError::Timeout
                | DownloadError::IncompleteSegment { .. }
        )
    }

    pub fn io(op: &'static str, path: PathBuf, source: std::io::Error) -> Self {
        DownloadError::FileIO { op, path, source }
    }
}

impl From<curl::Error> for DownloadError {
    fn from(e: curl::Error) -> Self {
        if e.is_operation_timedout() {
            DownloadError::Timeout
        } else {
            DownloadError::Network(e.to_string())
        }
    }
}

impl From<sqlx::Error> for DownloadError {
    fn from(e: sqlx::Error) -> Self {
        DownloadError::Store(e.to_string())
    }
}
