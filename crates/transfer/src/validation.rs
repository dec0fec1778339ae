use std::path::{Component, Path};

use crate::TransferError;
use crate::chunk::checked_chunk_count;
use crate::source::FileDescriptor;

/// Acceptance rules applied before a file is fingerprinted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRules {
    /// Largest accepted size in bytes.
    pub max_file_size: u64,
    /// Accepted extensions without the dot. Empty accepts any.
    pub allowed_extensions: Vec<String>,
    /// Chunk size the file will be split with. Zero skips the chunk count check.
    pub chunk_size: u64,
}

/// Extension used for allow-list matching.
///
/// The text after the last dot. A name without a dot, or whose only dot is
/// its first character, is its own extension.
pub fn file_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[idx + 1..],
        _ => name,
    }
}

/// Checks a file against `rules` and validates its relative path.
///
/// Extension matching ignores ASCII case.
pub fn validate_file(descriptor: &FileDescriptor, rules: &FileRules) -> Result<(), TransferError> {
    if descriptor.size == 0 {
        return Err(TransferError::Validation(format!(
            "{}: file is empty",
            descriptor.name
        )));
    }
    if descriptor.size > rules.max_file_size {
        return Err(TransferError::Validation(format!(
            "{}: size {} exceeds limit {}",
            descriptor.name, descriptor.size, rules.max_file_size
        )));
    }
    if checked_chunk_count(descriptor.size, rules.chunk_size).is_none() {
        return Err(TransferError::Validation(format!(
            "{}: size {} needs more than {} chunks of {} bytes",
            descriptor.name,
            descriptor.size,
            u32::MAX,
            rules.chunk_size
        )));
    }

    if !rules.allowed_extensions.is_empty() {
        let ext = file_extension(&descriptor.name);
        let allowed = rules
            .allowed_extensions
            .iter()
            .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(ext));
        if !allowed {
            return Err(TransferError::Validation(format!(
                "{}: extension '{ext}' not allowed",
                descriptor.name
            )));
        }
    }

    validate_upload_path(&descriptor.relative_path)
}

/// Validates that a relative file path does not escape its base directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_upload_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    let path = Path::new(file_path);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
