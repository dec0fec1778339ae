//! Multi-file uploader built on the chunked transfer engine.
//!
//! Provides the HTTP endpoint, the [`TransferManager`] queue, its listener
//! surface, TOML configuration and a directory scanner.

pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod manager;
pub mod scanner;

pub use config::{DEFAULT_MAX_FILE_SIZE, HttpEndpointConfig, UploaderConfig};
pub use error::UploadError;
pub use events::{EventChannel, TransferEvent, TransferListener};
pub use http::HttpEndpoint;
pub use manager::{AddOutcome, TransferManager};
pub use scanner::{ScannedFile, scan_path, scan_paths};
