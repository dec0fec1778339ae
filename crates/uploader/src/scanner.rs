//! File scanning for upload.
//!
//! Turns the paths given by the user into upload candidates. A directory
//! is walked recursively and each file gets a relative path that starts
//! with the directory's own name, normalized to forward slashes.

use std::path::{Path, PathBuf};

use chunkup_transfer::{LocalFile, TransferError};

use crate::error::UploadError;

/// A file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Path sent to the server, e.g. `photos/2024/a.jpg`.
    pub relative_path: String,
    pub size: u64,
}

impl ScannedFile {
    /// Opens the file as an upload source carrying its relative path.
    pub async fn open(&self) -> Result<LocalFile, TransferError> {
        Ok(LocalFile::open(&self.path)
            .await?
            .with_relative_path(self.relative_path.clone()))
    }
}

/// Scans `path`, which may be a file or a directory.
///
/// Returns the files sorted by relative path and their total size in bytes.
pub fn scan_path(path: &Path) -> Result<(Vec<ScannedFile>, u64), UploadError> {
    let metadata = std::fs::metadata(path)?;
    let mut files = Vec::new();
    let mut total_size = 0;

    if metadata.is_file() {
        let name = file_name(path);
        files.push(ScannedFile {
            path: path.to_path_buf(),
            relative_path: name,
            size: metadata.len(),
        });
        total_size = metadata.len();
    } else if metadata.is_dir() {
        let prefix = file_name(path);
        walk_dir(path, path, &prefix, &mut files, &mut total_size)?;
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    }

    tracing::debug!(path = %path.display(), files = files.len(), total_size, "path scanned");
    Ok((files, total_size))
}

/// Scans several paths, keeping the order they were given in.
pub fn scan_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<ScannedFile>, UploadError> {
    let mut all = Vec::new();
    for path in paths {
        let (files, _) = scan_path(path.as_ref())?;
        all.extend(files);
    }
    Ok(all)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn walk_dir(
    root: &Path,
    current: &Path,
    prefix: &str,
    files: &mut Vec<ScannedFile>,
    total_size: &mut u64,
) -> Result<(), UploadError> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            walk_dir(root, &path, prefix, files, total_size)?;
        } else if metadata.is_file() {
            let rel_path = path.strip_prefix(root).map_err(std::io::Error::other)?;
            let rel_str = rel_path.to_string_lossy().replace('\\', "/");
            let relative_path = if prefix.is_empty() {
                rel_str
            } else {
                format!("{prefix}/{rel_str}")
            };

            files.push(ScannedFile {
                path,
                relative_path,
                size: metadata.len(),
            });
            *total_size += metadata.len();
        }
    }
    Ok(())
}
