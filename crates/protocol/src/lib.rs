//! Wire types for the chunked upload endpoints.
//!
//! The upload server exposes four endpoints that share one response
//! envelope ([`ApiResult`]):
//!
//! - **skip-check**: `GET`, answers whether a fingerprint is already stored
//! - **chunk**: `POST` multipart, stores one chunk
//! - **delete**: `DELETE`, drops partial chunk state for a fingerprint
//! - **merge**: `POST` JSON, assembles the stored chunks into the final file

pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::DEFAULT_SUCCESS_CODE;
pub use envelope::ApiResult;
pub use messages::{
    ChunkResult, ChunkUploadForm, DeleteChunkQuery, FolderQuery, SkipCheckData, SkipCheckQuery,
    UploadedFileInfo,
};
