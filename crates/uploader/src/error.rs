//! Uploader error types.

use chunkup_transfer::{Fingerprint, TransferError};

/// Errors produced by the uploader layer.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown file: {0}")]
    UnknownFile(Fingerprint),
}

impl From<UploadError> for TransferError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Transfer(e) => e,
            UploadError::Io(e) => TransferError::Read(e),
            UploadError::Config(msg) => TransferError::Validation(msg),
            UploadError::Api { status, body } => {
                TransferError::Network(format!("HTTP {status}: {body}"))
            }
            UploadError::UnknownFile(fp) => {
                TransferError::SessionState(format!("unknown file: {fp}"))
            }
            other => TransferError::Network(other.to_string()),
        }
    }
}
