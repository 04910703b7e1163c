use reqwest::StatusCode;

/// Error type shared by every layer of the accelerator.
#[derive(Debug, thiserror::Error)]
pub enum BlobCacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned status code {0}")]
    StatusCode(StatusCode),

    #[error("Invalid URL: {0}")]
    UrlError(String),

    #[error("Unsupported content encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Invalid cache file format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported cache file version {found} (expected {expected})")]
    UnsupportedVersion { found: u64, expected: u64 },

    #[error("Cache header invariant violated: {0}")]
    HeaderInvariant(String),

    #[error("Index {index} out of range (size {size})")]
    OutOfRange { index: u64, size: u64 },

    #[error("Block size mismatch: expected {expected} bytes, got {actual}")]
    BlockSizeMismatch { expected: u64, actual: u64 },

    #[error("Invalid byte range [{start}, {end}) for file of size {file_size}")]
    InvalidRange { start: u64, end: u64, file_size: u64 },

    #[error("Cannot shrink cache file from {current} to {requested} bytes")]
    ShrinkRejected { current: u64, requested: u64 },

    #[error("File size {file_size} exceeds cache capacity of {capacity} bytes")]
    CapacityExceeded { file_size: u64, capacity: u64 },

    #[error("Cache file is closed")]
    Closed,

    #[error("Worker pool is closed")]
    PoolClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl BlobCacheError {
    /// Cancellation is a cooperative exit, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BlobCacheError::Cancelled)
    }

    /// Errors raised by the cache file itself, for which the request falls
    /// back to a direct remote fetch.
    pub fn is_cache_error(&self) -> bool {
        matches!(
            self,
            BlobCacheError::Io(_)
                | BlobCacheError::InvalidFormat(_)
                | BlobCacheError::UnsupportedVersion { .. }
                | BlobCacheError::HeaderInvariant(_)
                | BlobCacheError::Closed
        )
    }
}

impl From<tokio::task::JoinError> for BlobCacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            BlobCacheError::Cancelled
        } else {
            BlobCacheError::Internal(format!("background task failed: {err}"))
        }
    }
}
