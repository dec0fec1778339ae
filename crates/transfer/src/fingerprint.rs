use std::fmt;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::chunk::chunk_count;
use crate::source::FileSource;

/// Content-derived identifier of a file.
///
/// Used as the server-side correlation key for every chunk, skip-check,
/// delete and merge request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which bytes of the file feed the digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintStrategy {
    /// First chunk plus the span from the second chunk up to the start of
    /// the last chunk. Cost is bounded regardless of file size, but bytes
    /// outside those ranges do not affect the result.
    #[default]
    HeadTail,
    /// Every byte of the file.
    Full,
}

/// Byte ranges hashed by [`FingerprintStrategy::HeadTail`], in digest order.
///
/// Empty ranges are omitted. Two files of the same content and chunk size
/// always produce the same ranges.
pub fn hashed_ranges(size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::with_capacity(2);
    let head_end = chunk_size.min(size);
    if head_end > 0 {
        ranges.push((0, head_end));
    }

    let count = chunk_count(size, chunk_size);
    if count > 1 {
        let tail_end = chunk_size.saturating_mul(u64::from(count - 1)).min(size);
        if tail_end > chunk_size {
            ranges.push((chunk_size, tail_end));
        }
    }
    ranges
}

/// Computes the head/tail fingerprint of `source`.
pub async fn fingerprint(
    source: &dyn FileSource,
    chunk_size: u64,
) -> Result<Fingerprint, TransferError> {
    fingerprint_with(source, chunk_size, FingerprintStrategy::HeadTail).await
}

/// Computes the fingerprint of `source` with the given strategy.
///
/// Fails with [`TransferError::Read`] if the source cannot be read.
pub async fn fingerprint_with(
    source: &dyn FileSource,
    chunk_size: u64,
    strategy: FingerprintStrategy,
) -> Result<Fingerprint, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::Validation("chunk size must be > 0".into()));
    }

    let size = source.descriptor().size;
    let ranges = match strategy {
        FingerprintStrategy::HeadTail => hashed_ranges(size, chunk_size),
        FingerprintStrategy::Full => {
            let mut ranges = Vec::new();
            let mut start = 0;
            while start < size {
                let end = (start + chunk_size).min(size);
                ranges.push((start, end));
                start = end;
            }
            ranges
        }
    };

    let mut hasher = Md5::new();
    for (start, end) in ranges {
        let bytes = source.read_range(start, end).await?;
        hasher.update(&bytes);
    }
    let fp = Fingerprint(hex::encode(hasher.finalize()));

    tracing::debug!(
        name = %source.descriptor().name,
        size,
        ?strategy,
        fingerprint = %fp,
        "fingerprint computed"
    );
    Ok(fp)
}

/// Head/tail fingerprint of an in-memory buffer.
pub fn fingerprint_bytes(data: &[u8], chunk_size: u64) -> Result<Fingerprint, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::Validation("chunk size must be > 0".into()));
    }

    let mut hasher = Md5::new();
    for (start, end) in hashed_ranges(data.len() as u64, chunk_size) {
        hasher.update(&data[start as usize..end as usize]);
    }
    Ok(Fingerprint(hex::encode(hasher.finalize())))
}
