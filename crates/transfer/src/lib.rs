//! Resumable chunked upload engine.
//!
//! A file is fingerprinted from its content, split into fixed-size chunks,
//! and each chunk is pushed through a bounded admission controller to a
//! remote [`UploadEndpoint`]. A [`TransferSession`] owns the chunks of one
//! file and aggregates their progress; it supports pause, resume, cancel
//! and resume-from-offset after a skip-check.

mod chunk;
mod endpoint;
mod fingerprint;
mod progress;
mod scheduler;
mod session;
mod source;
mod validation;

#[cfg(test)]
mod testing;

pub use chunk::{Chunk, ChunkSpec, ChunkStatus, checked_chunk_count, chunk_count, plan_chunks};
pub use endpoint::{ChunkUpload, EndpointFuture, ProgressFn, UploadEndpoint};
pub use fingerprint::{
    Fingerprint, FingerprintStrategy, fingerprint, fingerprint_bytes, fingerprint_with,
    hashed_ranges,
};
pub use progress::{ProgressThrottle, StatsSnapshot, file_progress, file_speed, time_remaining};
pub use scheduler::{ChunkPermit, ChunkScheduler};
pub use session::{SessionConfig, SessionInfo, SessionListener, SessionState, TransferSession};
pub use source::{FileDescriptor, FileSource, LocalFile, MemoryFile, detect_content_type};
pub use validation::{FileRules, file_extension, validate_file, validate_upload_path};

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Default number of chunk requests allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 3;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("read error: {0}")]
    Read(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("{code}:{message}")]
    Application { code: i64, message: String },

    #[error("aborted")]
    Aborted,

    #[error("chunk {index}: cannot move from {from} to {to}")]
    InvalidTransition {
        index: u32,
        from: ChunkStatus,
        to: ChunkStatus,
    },

    #[error("invalid session state: {0}")]
    SessionState(String),
}

/// Coarse classification of a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any I/O.
    Validation,
    /// Local byte source could not be read.
    Read,
    /// Transport failure or non-success HTTP status.
    Network,
    /// Non-success application code in an otherwise good response.
    Application,
    /// Cancelled by the caller; not a fault.
    Aborted,
    /// Operation not legal in the current state.
    State,
}

impl TransferError {
    /// Returns the error's classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidPath(_) => ErrorKind::Validation,
            Self::Read(_) => ErrorKind::Read,
            Self::Network(_) => ErrorKind::Network,
            Self::Application { .. } => ErrorKind::Application,
            Self::Aborted => ErrorKind::Aborted,
            Self::InvalidTransition { .. } | Self::SessionState(_) => ErrorKind::State,
        }
    }

    /// Returns `true` for caller-initiated cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Returns `true` if another attempt of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Application)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(
            TransferError::Validation("too big".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            TransferError::InvalidPath("..".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            TransferError::Read(std::io::Error::other("gone")).kind(),
            ErrorKind::Read
        );
        assert_eq!(TransferError::Aborted.kind(), ErrorKind::Aborted);
        assert!(TransferError::Aborted.is_aborted());
        assert!(!TransferError::Network("reset".into()).is_aborted());
    }

    #[test]
    fn application_error_message_format() {
        let err = TransferError::Application {
            code: 20001,
            message: "upload failed".into(),
        };
        assert_eq!(err.to_string(), "20001:upload failed");
        assert!(err.is_retryable());
    }

    #[test]
    fn read_and_abort_not_retryable() {
        assert!(!TransferError::Aborted.is_retryable());
        assert!(!TransferError::Read(std::io::Error::other("x")).is_retryable());
        assert!(TransferError::Network("timeout".into()).is_retryable());
    }
}
