//! One byte range of a file and its transfer state machine.
//!
//! ```text
//! Pending ──► Reading ──► Uploading ──► Success
//!    ▲                        │
//!    │                        ├──► Error ──(retry)──┐
//!    │                        └──► Aborted          │
//!    └──────────────────────────────────────────────┘
//! ```

use std::fmt;

use bytes::Bytes;
use chunkup_protocol::ChunkUploadForm;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::fingerprint::Fingerprint;
use crate::source::FileDescriptor;

/// Transfer status of a [`Chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Reading,
    Uploading,
    Success,
    Error,
    Aborted,
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Reading => "reading",
            Self::Uploading => "uploading",
            Self::Success => "success",
            Self::Error => "error",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Immutable geometry of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpec {
    /// 0-based position in the file.
    pub index: u32,
    pub start_byte: u64,
    /// Exclusive.
    pub end_byte: u64,
    pub total_chunks: u32,
    pub fingerprint: Fingerprint,
}

impl ChunkSpec {
    pub fn len(&self) -> u64 {
        self.end_byte - self.start_byte
    }

    pub fn is_empty(&self) -> bool {
        self.start_byte == self.end_byte
    }

    /// 1-based number used on the wire.
    pub fn chunk_number(&self) -> u32 {
        self.index + 1
    }
}

/// Number of chunks for a file of `size` bytes; at least 1.
///
/// Saturates at `u32::MAX`. Files are checked with [`checked_chunk_count`]
/// before they are planned.
pub fn chunk_count(size: u64, chunk_size: u64) -> u32 {
    checked_chunk_count(size, chunk_size).unwrap_or(u32::MAX)
}

/// Like [`chunk_count`], but `None` when the count does not fit the 32-bit
/// chunk numbers used on the wire.
pub fn checked_chunk_count(size: u64, chunk_size: u64) -> Option<u32> {
    if chunk_size == 0 {
        return Some(1);
    }
    u32::try_from(size.div_ceil(chunk_size).max(1)).ok()
}

/// Splits `[0, size)` into consecutive chunk ranges.
///
/// A zero-byte file yields one chunk spanning `[0, 0)`.
pub fn plan_chunks(size: u64, chunk_size: u64, fingerprint: &Fingerprint) -> Vec<ChunkSpec> {
    let total_chunks = chunk_count(size, chunk_size);
    (0..total_chunks)
        .map(|index| {
            let start_byte = (u64::from(index) * chunk_size).min(size);
            let end_byte = ((u64::from(index) + 1) * chunk_size).min(size);
            ChunkSpec {
                index,
                start_byte,
                end_byte,
                total_chunks,
                fingerprint: fingerprint.clone(),
            }
        })
        .collect()
}

/// Mutable transfer state of one chunk.
#[derive(Debug)]
pub struct Chunk {
    spec: ChunkSpec,
    status: ChunkStatus,
    loaded: u64,
    total: u64,
    attempt_started: Option<Instant>,
    attempts: u32,
    cancel: CancellationToken,
    error: Option<String>,
    bytes: Option<Bytes>,
}

impl Chunk {
    pub fn new(spec: ChunkSpec) -> Self {
        Self {
            spec,
            status: ChunkStatus::Pending,
            loaded: 0,
            total: 0,
            attempt_started: None,
            attempts: 0,
            cancel: CancellationToken::new(),
            error: None,
            bytes: None,
        }
    }

    pub fn spec(&self) -> &ChunkSpec {
        &self.spec
    }

    pub fn index(&self) -> u32 {
        self.spec.index
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    /// Upload attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Message of the last failure, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Token that interrupts the current read or upload.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Buffered bytes of the current attempt.
    pub fn bytes(&self) -> Option<&Bytes> {
        self.bytes.as_ref()
    }

    fn transition(
        &mut self,
        allowed: &[ChunkStatus],
        to: ChunkStatus,
    ) -> Result<(), TransferError> {
        if !allowed.contains(&self.status) {
            return Err(TransferError::InvalidTransition {
                index: self.spec.index,
                from: self.status,
                to,
            });
        }
        tracing::debug!(
            fingerprint = %self.spec.fingerprint,
            chunk = self.spec.index,
            from = %self.status,
            to = %to,
            "chunk transition"
        );
        self.status = to;
        Ok(())
    }

    /// `Pending → Reading`.
    pub fn begin_read(&mut self) -> Result<(), TransferError> {
        self.transition(&[ChunkStatus::Pending], ChunkStatus::Reading)
    }

    /// `Reading → Uploading`. Buffers the bytes and starts a new attempt.
    pub fn begin_upload(&mut self, bytes: Bytes) -> Result<(), TransferError> {
        self.transition(&[ChunkStatus::Reading], ChunkStatus::Uploading)?;
        self.loaded = 0;
        self.total = 0;
        self.attempt_started = Some(Instant::now());
        self.attempts += 1;
        self.error = None;
        self.bytes = Some(bytes);
        Ok(())
    }

    /// Records transport progress of the current attempt.
    ///
    /// Ignored unless the chunk is uploading.
    pub fn record_progress(&mut self, loaded: u64, total: u64) {
        if self.status == ChunkStatus::Uploading {
            self.loaded = loaded;
            self.total = total;
        }
    }

    /// `Uploading → Success`. Progress becomes exactly 1.
    pub fn succeed(&mut self) -> Result<(), TransferError> {
        self.transition(&[ChunkStatus::Uploading], ChunkStatus::Success)?;
        self.loaded = self.spec.len();
        self.total = self.spec.len();
        self.attempt_started = None;
        self.bytes = None;
        Ok(())
    }

    /// `Reading | Uploading → Error`.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransferError> {
        self.transition(
            &[ChunkStatus::Reading, ChunkStatus::Uploading],
            ChunkStatus::Error,
        )?;
        self.error = Some(message.into());
        self.attempt_started = None;
        self.bytes = None;
        Ok(())
    }

    /// `Reading | Uploading → Aborted`. Cancels the in-flight request.
    ///
    /// Returns `false` if there was nothing in flight.
    pub fn abort(&mut self) -> bool {
        if !matches!(self.status, ChunkStatus::Reading | ChunkStatus::Uploading) {
            return false;
        }
        self.cancel.cancel();
        self.status = ChunkStatus::Aborted;
        self.attempt_started = None;
        self.bytes = None;
        tracing::debug!(
            fingerprint = %self.spec.fingerprint,
            chunk = self.spec.index,
            "chunk aborted"
        );
        true
    }

    /// `Error | Aborted → Pending`, with a fresh cancellation token.
    pub fn reset(&mut self) -> Result<(), TransferError> {
        self.transition(
            &[ChunkStatus::Error, ChunkStatus::Aborted],
            ChunkStatus::Pending,
        )?;
        self.loaded = 0;
        self.total = 0;
        self.cancel = CancellationToken::new();
        Ok(())
    }

    /// `Pending → Success` for chunks the server already holds.
    pub fn mark_uploaded(&mut self) -> Result<(), TransferError> {
        self.transition(&[ChunkStatus::Pending], ChunkStatus::Success)?;
        self.loaded = self.spec.len();
        self.total = self.spec.len();
        Ok(())
    }

    /// Fraction transferred, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        match self.status {
            ChunkStatus::Success => 1.0,
            ChunkStatus::Uploading if self.total > 0 => {
                (self.loaded as f64 / self.total as f64).min(1.0)
            }
            _ => 0.0,
        }
    }

    /// Bytes of this chunk counted as transferred.
    pub fn size_uploaded(&self) -> f64 {
        self.progress() * self.spec.len() as f64
    }

    /// Speed of the current attempt in bytes per millisecond.
    ///
    /// `None` when not uploading or when no time has elapsed yet.
    pub fn measure_speed(&self, now: Instant) -> Option<f64> {
        if self.status != ChunkStatus::Uploading {
            return None;
        }
        let started = self.attempt_started?;
        let elapsed_ms = now.saturating_duration_since(started).as_secs_f64() * 1000.0;
        if elapsed_ms <= 0.0 {
            return None;
        }
        Some(self.loaded as f64 / elapsed_ms)
    }

    /// Text fields of the upload request for this chunk.
    pub fn upload_form(&self, descriptor: &FileDescriptor, chunk_size: u64) -> ChunkUploadForm {
        ChunkUploadForm {
            chunk_number: self.spec.chunk_number(),
            chunk_size,
            current_chunk_size: self.spec.len(),
            total_size: descriptor.size,
            fingerprint: self.spec.fingerprint.to_string(),
            filename: descriptor.name.clone(),
            relative_path: descriptor.relative_path.clone(),
            total_chunks: self.spec.total_chunks,
        }
    }
}
