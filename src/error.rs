//! Typed errors for the streaming transport.
//!
//! One variant per sticky failure kind that can latch into the shared
//! record (§7); the underlying C driver this protocol descends from kept
//! these as an `enum error_codes` living in shared memory, so they must
//! also be cheap to clone and stash there.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    #[error("success")]
    Success,
    #[error("ran out of disk space while staging a cache file")]
    OutOfDiskSpace,
    #[error("allocation failed")]
    BadAlloc,
    #[error("bytes transferred did not match the expected length")]
    BytesTransferredMismatch,
    #[error("failed to initiate multipart upload")]
    InitiateMultipartUploadError,
    #[error("failed to complete multipart upload")]
    CompleteMultipartUploadError,
    #[error("failed to upload a part")]
    UploadFileError,
    #[error("failed to download object data")]
    DownloadFileError,
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::Success
    }
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        matches!(self, ErrorCode::Success)
    }
}

/// Top-level error type returned by transport public operations.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid file path {0:?}: expected /bucket/key")]
    InvalidFilePath(String),

    #[error("transport is not open")]
    NotOpen,

    #[error(transparent)]
    Sticky(#[from] StickyError),

    #[error("circular buffer wait timed out after {0:?}")]
    BufferTimeout(std::time::Duration),

    #[error("s3 get error: {0}")]
    S3Get(String),

    #[error("s3 put error: {0}")]
    S3Put(String),

    #[error("s3 copy error: {0}")]
    S3Copy(String),

    #[error("s3 unlink error: {0}")]
    S3Unlink(String),

    #[error("s3 stat error: {0}")]
    S3Stat(String),

    #[error("s3 client init error: {0}")]
    S3Init(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource is down")]
    ResourceDown,

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload worker thread panicked: {0}")]
    UploadWorkerPanicked(String),
}

/// Wraps an [`ErrorCode`] once it has been latched into the shared record:
/// from that point on every transport sharing the key observes the same
/// sticky failure and short-circuits (§7 propagation policy).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation failed with sticky error: {0}")]
pub struct StickyError(pub ErrorCode);

pub type Result<T> = std::result::Result<T, TransportError>;
