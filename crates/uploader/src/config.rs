//! Uploader configuration.
//!
//! Stored as TOML. Every field is optional; missing fields take the
//! defaults below.
//!
//! ```toml
//! chunk_size = 5242880
//! max_concurrent_chunks = 3
//! allowed_extensions = ["mp4", "zip"]
//!
//! [endpoint]
//! base_url = "http://localhost:8080"
//! upload_folder_path = "/videos"
//!
//! [endpoint.headers]
//! Authorization = "Bearer secret"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chunkup_protocol::constants::{
    CHUNK_UPLOAD_PATH, DEFAULT_FILE_PARAMETER_NAME, DEFAULT_UPLOAD_FOLDER_PATH,
    DELETE_CHUNKS_PATH, MERGE_PATH, SKIP_CHECK_PATH,
};
use chunkup_protocol::DEFAULT_SUCCESS_CODE;
use chunkup_transfer::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_CHUNKS, FileRules, FingerprintStrategy,
    SessionConfig, checked_chunk_count,
};
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

/// Default upper bound on file size: 200 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 200 * 1024 * 1024;

/// Configuration of a [`TransferManager`](crate::TransferManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Chunk size in bytes.
    pub chunk_size: u64,

    /// Chunk requests in flight, per file and across all files.
    pub max_concurrent_chunks: usize,

    /// Files uploading at once. 1 uploads files one after another.
    pub max_active_files: usize,

    /// Largest accepted file in bytes.
    pub max_file_size: u64,

    /// Accepted extensions; empty accepts any.
    pub allowed_extensions: Vec<String>,

    /// Start uploading as soon as a file is accepted.
    pub auto_start: bool,

    /// Application codes treated as success.
    pub success_codes: Vec<i64>,

    /// Automatic re-attempts per failed chunk.
    pub max_chunk_retries: u32,

    pub fingerprint_strategy: FingerprintStrategy,

    /// Minimum gap between progress notifications, in milliseconds.
    pub progress_interval_ms: u64,

    pub endpoint: HttpEndpointConfig,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            max_active_files: 1,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_extensions: Vec::new(),
            auto_start: true,
            success_codes: vec![DEFAULT_SUCCESS_CODE],
            max_chunk_retries: 0,
            fingerprint_strategy: FingerprintStrategy::HeadTail,
            progress_interval_ms: 200,
            endpoint: HttpEndpointConfig::default(),
        }
    }
}

/// Where and how requests are sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpEndpointConfig {
    pub base_url: String,
    pub skip_check_path: String,
    pub chunk_upload_path: String,
    pub delete_path: String,
    pub merge_path: String,
    /// Server-side folder receiving the files.
    pub upload_folder_path: String,
    /// Multipart field carrying the chunk bytes.
    pub file_parameter_name: String,
    /// Per-request timeout in seconds; 0 disables it.
    pub timeout_secs: u64,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            skip_check_path: SKIP_CHECK_PATH.into(),
            chunk_upload_path: CHUNK_UPLOAD_PATH.into(),
            delete_path: DELETE_CHUNKS_PATH.into(),
            merge_path: MERGE_PATH.into(),
            upload_folder_path: DEFAULT_UPLOAD_FOLDER_PATH.into(),
            file_parameter_name: DEFAULT_FILE_PARAMETER_NAME.into(),
            timeout_secs: 0,
            headers: BTreeMap::new(),
        }
    }
}

impl UploaderConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, UploadError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, UploadError> {
        let config: UploaderConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::Config("chunk_size must be > 0".into()));
        }
        if checked_chunk_count(self.max_file_size, self.chunk_size).is_none() {
            return Err(UploadError::Config(format!(
                "max_file_size {} needs more than {} chunks of chunk_size {}",
                self.max_file_size,
                u32::MAX,
                self.chunk_size
            )));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(UploadError::Config(
                "max_concurrent_chunks must be > 0".into(),
            ));
        }
        if self.max_active_files == 0 {
            return Err(UploadError::Config("max_active_files must be > 0".into()));
        }
        if self.success_codes.is_empty() {
            return Err(UploadError::Config("success_codes must not be empty".into()));
        }
        if self.endpoint.base_url.trim().is_empty() {
            return Err(UploadError::Config("endpoint.base_url is required".into()));
        }
        Ok(())
    }

    /// Settings handed to every [`TransferSession`](chunkup_transfer::TransferSession).
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            chunk_size: self.chunk_size,
            max_concurrent_chunks: self.max_concurrent_chunks,
            success_codes: self.success_codes.clone(),
            max_chunk_retries: self.max_chunk_retries,
            upload_folder_path: self.endpoint.upload_folder_path.clone(),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }

    /// Acceptance rules for new files.
    pub fn file_rules(&self) -> FileRules {
        FileRules {
            max_file_size: self.max_file_size,
            allowed_extensions: self.allowed_extensions.clone(),
            chunk_size: self.chunk_size,
        }
    }
}
