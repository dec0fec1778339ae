//! File descriptors and the byte sources that back them.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;

/// Immutable description of a file offered for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    /// Path sent to the server; defaults to `name`.
    pub relative_path: String,
    pub content_type: String,
}

impl FileDescriptor {
    /// Creates a descriptor whose relative path is the file name and whose
    /// content type is guessed from the extension.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        let content_type = detect_content_type(&name).to_string();
        Self {
            relative_path: name.clone(),
            name,
            size,
            content_type,
        }
    }

    /// Overrides the relative path.
    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = relative_path.into();
        self
    }

    /// Overrides the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// A readable file.
///
/// Implemented by whatever owns the bytes: a local file, an in-memory
/// buffer, a browser blob bridged through FFI, and so on.
pub trait FileSource: Send + Sync {
    /// Returns the file's descriptor.
    fn descriptor(&self) -> &FileDescriptor;

    /// Reads bytes `[start, end)`. The returned buffer holds exactly
    /// `end - start` bytes.
    fn read_range(
        &self,
        start: u64,
        end: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, TransferError>> + Send + '_>>;
}

// ---------------------------------------------------------------------------
// LocalFile
// ---------------------------------------------------------------------------

/// A file on the local filesystem.
///
/// Each read opens the file, seeks and reads exactly the requested range,
/// so concurrent chunk reads never share a cursor.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    descriptor: FileDescriptor,
}

impl LocalFile {
    /// Stats `path` and builds its descriptor.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(TransferError::Validation(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            descriptor: FileDescriptor::new(name, metadata.len()),
            path,
        })
    }

    /// Overrides the relative path reported to the server.
    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.descriptor.relative_path = relative_path.into();
        self
    }

    /// Local path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileSource for LocalFile {
    fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    fn read_range(
        &self,
        start: u64,
        end: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, TransferError>> + Send + '_>> {
        Box::pin(async move {
            let len = end.saturating_sub(start) as usize;
            let mut buf = vec![0u8; len];
            if len > 0 {
                let mut file = tokio::fs::File::open(&self.path).await?;
                file.seek(SeekFrom::Start(start)).await?;
                file.read_exact(&mut buf).await?;
            }
            Ok(Bytes::from(buf))
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryFile
// ---------------------------------------------------------------------------

/// A file held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    descriptor: FileDescriptor,
    data: Bytes,
}

impl MemoryFile {
    /// Wraps `data` under the given file name.
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            descriptor: FileDescriptor::new(name, data.len() as u64),
            data,
        }
    }

    /// Overrides the relative path reported to the server.
    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.descriptor.relative_path = relative_path.into();
        self
    }
}

impl FileSource for MemoryFile {
    fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    fn read_range(
        &self,
        start: u64,
        end: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, TransferError>> + Send + '_>> {
        Box::pin(async move {
            let size = self.data.len() as u64;
            if start > end || end > size {
                return Err(TransferError::Read(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("range {start}..{end} outside 0..{size}"),
                )));
            }
            Ok(self.data.slice(start as usize..end as usize))
        })
    }
}

/// Guesses a MIME type from the file extension.
///
/// Unknown extensions map to `application/octet-stream`.
pub fn detect_content_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("mp3") => "audio/mpeg",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("json") => "application/json",
        Some("txt" | "log") => "text/plain",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        _ => "application/octet-stream",
    }
}
