//! Per-file transfer: owns the chunks, fans them out through the admission
//! controllers and folds their progress into file-level figures.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chunkup_protocol::{DEFAULT_SUCCESS_CODE, DeleteChunkQuery, UploadedFileInfo};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chunk::{Chunk, ChunkStatus, plan_chunks};
use crate::endpoint::{ChunkUpload, ProgressFn, UploadEndpoint};
use crate::fingerprint::Fingerprint;
use crate::progress::{ProgressThrottle, StatsSnapshot, file_progress, file_speed, time_remaining};
use crate::scheduler::{ChunkPermit, ChunkScheduler};
use crate::source::{FileDescriptor, FileSource};
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_CHUNKS, TransferError};

/// Engine-level settings of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub chunk_size: u64,
    /// Capacity of the session's own admission controller.
    pub max_concurrent_chunks: usize,
    /// Application codes treated as success.
    pub success_codes: Vec<i64>,
    /// Automatic re-attempts per chunk after a network or application error.
    pub max_chunk_retries: u32,
    pub upload_folder_path: String,
    /// Minimum gap between two progress notifications.
    pub progress_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            success_codes: vec![DEFAULT_SUCCESS_CODE],
            max_chunk_retries: 0,
            upload_folder_path: chunkup_protocol::constants::DEFAULT_UPLOAD_FOLDER_PATH.into(),
            progress_interval: Duration::from_millis(200),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::Validation("chunk size must be > 0".into()));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(TransferError::Validation(
                "max concurrent chunks must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Aggregate state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Active,
    Paused,
    Error,
    Complete,
    Cancelled,
}

impl SessionState {
    /// `true` while chunks are being driven.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a session, handed to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub name: String,
    pub size: u64,
    pub fingerprint: Option<Fingerprint>,
    pub state: SessionState,
    /// Whole percent.
    pub progress: u8,
    /// Bytes per millisecond; `None` when no chunk is uploading.
    pub speed: Option<u64>,
    /// Seconds; `None` when speed is unknown.
    pub time_remaining: Option<u64>,
    pub paused: bool,
    pub message: String,
}

impl SessionInfo {
    /// Info for a file that never got a session (e.g. rejected by validation).
    pub fn unstarted(descriptor: &FileDescriptor, message: impl Into<String>) -> Self {
        Self {
            name: descriptor.name.clone(),
            size: descriptor.size,
            fingerprint: None,
            state: SessionState::Error,
            progress: 0,
            speed: None,
            time_remaining: None,
            paused: false,
            message: message.into(),
        }
    }
}

/// Observer of a single session.
///
/// `on_progress` is called with the session's emission lock held, so a
/// listener sees snapshots in the order they were taken. It must not pause
/// or resume the session it observes.
pub trait SessionListener: Send + Sync {
    fn on_progress(&self, _info: &SessionInfo) {}
    fn on_success(&self, _info: &SessionInfo) {}
    fn on_failure(&self, _info: &SessionInfo, _error: &TransferError) {}
}

struct SessionInner {
    chunks: Vec<Chunk>,
    state: SessionState,
    paused: bool,
    message: String,
    stats: StatsSnapshot,
    throttle: ProgressThrottle,
    /// Stops queued chunks of the current run; replaced on every run.
    halt: CancellationToken,
}

/// Transfer of one file.
pub struct TransferSession {
    source: Arc<dyn FileSource>,
    fingerprint: Fingerprint,
    endpoint: Arc<dyn UploadEndpoint>,
    config: SessionConfig,
    scheduler: Arc<ChunkScheduler>,
    shared: Option<Arc<ChunkScheduler>>,
    inner: Mutex<SessionInner>,
    /// Taken before `inner`.
    emitting: Mutex<()>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
}

impl TransferSession {
    /// Creates a session with every chunk pending.
    pub fn new(
        source: Arc<dyn FileSource>,
        fingerprint: Fingerprint,
        endpoint: Arc<dyn UploadEndpoint>,
        config: SessionConfig,
    ) -> Self {
        let chunks = plan_chunks(source.descriptor().size, config.chunk_size, &fingerprint)
            .into_iter()
            .map(Chunk::new)
            .collect();
        Self {
            scheduler: ChunkScheduler::new(config.max_concurrent_chunks),
            shared: None,
            inner: Mutex::new(SessionInner {
                chunks,
                state: SessionState::Pending,
                paused: false,
                message: String::new(),
                stats: StatsSnapshot::default(),
                throttle: ProgressThrottle::new(config.progress_interval),
                halt: CancellationToken::new(),
            }),
            emitting: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            source,
            fingerprint,
            endpoint,
            config,
        }
    }

    /// Makes every chunk also hold a slot of `scheduler` while in flight.
    pub fn with_shared_scheduler(mut self, scheduler: Arc<ChunkScheduler>) -> Self {
        self.shared = Some(scheduler);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn emit(&self, f: impl Fn(&dyn SessionListener)) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for l in &listeners {
            f(l.as_ref());
        }
    }

    /// Guard held from taking a progress snapshot until listeners have it,
    /// so snapshots are delivered in the order they were taken.
    fn emitting(&self) -> MutexGuard<'_, ()> {
        self.emitting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        self.source.descriptor()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == SessionState::Cancelled
    }

    /// Status of every chunk, in index order.
    pub fn chunk_statuses(&self) -> Vec<ChunkStatus> {
        self.lock().chunks.iter().map(Chunk::status).collect()
    }

    /// Rebuilds the chunk set, marking the first `already_uploaded` chunks
    /// as done. Used to resume from what the server reports.
    pub fn generate_chunks(&self, already_uploaded: usize) -> Result<(), TransferError> {
        let mut inner = self.lock();
        if inner.state.is_running() {
            return Err(TransferError::SessionState(
                "cannot regenerate chunks while running".into(),
            ));
        }

        for chunk in &mut inner.chunks {
            chunk.abort();
        }
        let specs = plan_chunks(
            self.descriptor().size,
            self.config.chunk_size,
            &self.fingerprint,
        );
        let skip = already_uploaded.min(specs.len());
        inner.chunks = specs.into_iter().map(Chunk::new).collect();
        for chunk in &mut inner.chunks[..skip] {
            chunk.mark_uploaded()?;
        }
        self.refresh_stats(&mut inner);

        tracing::debug!(
            fingerprint = %self.fingerprint,
            total = inner.chunks.len(),
            already_uploaded = skip,
            "chunks generated"
        );
        Ok(())
    }

    /// Uploads every chunk that is not already done.
    ///
    /// Resolves once all chunks succeed. The first chunk failure halts the
    /// chunks still waiting for admission and returns immediately; chunks
    /// already in flight run to completion but no longer affect the
    /// session. Returns [`TransferError::Aborted`] if the session is
    /// cancelled.
    pub async fn run_all(self: &Arc<Self>) -> Result<(), TransferError> {
        let (pending, halt) = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Active | SessionState::Paused => {
                    return Err(TransferError::SessionState("session already running".into()));
                }
                SessionState::Cancelled => return Err(TransferError::Aborted),
                SessionState::Complete => return Ok(()),
                SessionState::Pending | SessionState::Error => {}
            }

            let stale = inner
                .chunks
                .iter()
                .any(|c| !matches!(c.status(), ChunkStatus::Pending | ChunkStatus::Success));
            if stale {
                return Err(TransferError::SessionState(
                    "chunks from a failed run must be retried first".into(),
                ));
            }

            inner.state = if inner.paused {
                SessionState::Paused
            } else {
                SessionState::Active
            };
            inner.message.clear();
            inner.halt = CancellationToken::new();
            inner.throttle.reset();

            let pending: Vec<usize> = inner
                .chunks
                .iter()
                .enumerate()
                .filter(|(_, c)| c.status() != ChunkStatus::Success)
                .map(|(i, _)| i)
                .collect();
            (pending, inner.halt.clone())
        };

        tracing::info!(
            fingerprint = %self.fingerprint,
            name = %self.descriptor().name,
            chunks = pending.len(),
            "upload started"
        );

        let mut tasks = JoinSet::new();
        for index in pending {
            let session = Arc::clone(self);
            let halt = halt.clone();
            tasks.spawn(async move { session.drive_chunk(index, halt).await });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(TransferError::SessionState(format!("chunk task failed: {e}")))
            });
            if let Err(err) = result {
                halt.cancel();
                tasks.detach_all();
                if err.is_aborted() || self.is_cancelled() {
                    return Err(TransferError::Aborted);
                }
                self.fail_with(&err);
                return Err(err);
            }
        }

        if self.is_cancelled() {
            return Err(TransferError::Aborted);
        }

        let info = {
            let mut inner = self.lock();
            inner.state = SessionState::Complete;
            inner.message = "upload complete".into();
            self.refresh_stats(&mut inner);
            self.snapshot(&inner)
        };
        tracing::info!(fingerprint = %self.fingerprint, "all chunks uploaded");
        self.emit(|l| l.on_success(&info));
        Ok(())
    }

    /// Drives one chunk to success, re-attempting retryable failures.
    async fn drive_chunk(
        self: Arc<Self>,
        index: usize,
        halt: CancellationToken,
    ) -> Result<(), TransferError> {
        loop {
            let err = match self.attempt_chunk(index, &halt).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_aborted() => return Err(err),
                Err(err) => err,
            };

            let retry = {
                let mut inner = self.lock();
                let chunk = &mut inner.chunks[index];
                err.is_retryable()
                    && !halt.is_cancelled()
                    && chunk.status() == ChunkStatus::Error
                    && chunk.attempts() <= self.config.max_chunk_retries
                    && chunk.reset().is_ok()
            };
            if !retry {
                return Err(err);
            }
            tracing::warn!(
                fingerprint = %self.fingerprint,
                chunk = index,
                error = %err,
                "retrying chunk"
            );
        }
    }

    async fn attempt_chunk(
        self: &Arc<Self>,
        index: usize,
        halt: &CancellationToken,
    ) -> Result<(), TransferError> {
        let _permits = tokio::select! {
            biased;
            _ = halt.cancelled() => return Err(TransferError::Aborted),
            permits = self.admit() => permits,
        };

        let (token, start, end) = {
            let mut inner = self.lock();
            if halt.is_cancelled() {
                return Err(TransferError::Aborted);
            }
            let chunk = &mut inner.chunks[index];
            chunk.begin_read()?;
            (
                chunk.cancel_token(),
                chunk.spec().start_byte,
                chunk.spec().end_byte,
            )
        };

        let read = tokio::select! {
            _ = token.cancelled() => return Err(TransferError::Aborted),
            read = self.source.read_range(start, end) => read,
        };
        let bytes = match read {
            Ok(bytes) => bytes,
            Err(err) => {
                self.record_failure(index, &token, &err);
                return Err(err);
            }
        };

        let upload = {
            let mut inner = self.lock();
            if token.is_cancelled() {
                return Err(TransferError::Aborted);
            }
            let chunk = &mut inner.chunks[index];
            chunk.begin_upload(bytes.clone())?;
            let descriptor = self.descriptor();
            ChunkUpload {
                form: chunk.upload_form(descriptor, self.config.chunk_size),
                data: bytes,
                filename: descriptor.name.clone(),
                content_type: descriptor.content_type.clone(),
                upload_folder_path: self.config.upload_folder_path.clone(),
            }
        };

        let progress: ProgressFn = {
            let session = Arc::clone(self);
            let token = token.clone();
            Arc::new(move |loaded, total| session.on_chunk_progress(index, &token, loaded, total))
        };

        let response = tokio::select! {
            _ = token.cancelled() => return Err(TransferError::Aborted),
            response = self.endpoint.upload_chunk(upload, progress) => response,
        };
        let outcome = match response {
            Ok(api) if api.is_success(&self.config.success_codes) => Ok(()),
            Ok(api) => Err(TransferError::Application {
                code: api.code,
                message: api.message,
            }),
            Err(err) => Err(err),
        };

        if let Err(err) = outcome {
            self.record_failure(index, &token, &err);
            return Err(err);
        }

        let _emitting = self.emitting();
        let info = {
            let mut inner = self.lock();
            if token.is_cancelled() {
                return Err(TransferError::Aborted);
            }
            inner.chunks[index].succeed()?;
            if !inner.state.is_running() {
                return Ok(());
            }
            self.refresh_stats(&mut inner);
            self.snapshot(&inner)
        };
        self.emit(|l| l.on_progress(&info));
        Ok(())
    }

    /// Session slot first, then the shared slot.
    async fn admit(&self) -> (ChunkPermit, Option<ChunkPermit>) {
        let local = self.scheduler.acquire().await;
        let shared = match &self.shared {
            Some(shared) => Some(shared.acquire().await),
            None => None,
        };
        (local, shared)
    }

    fn record_failure(&self, index: usize, token: &CancellationToken, err: &TransferError) {
        let mut inner = self.lock();
        if token.is_cancelled() {
            return;
        }
        let chunk = &mut inner.chunks[index];
        if chunk.fail(err.to_string()).is_ok() {
            tracing::debug!(
                fingerprint = %self.fingerprint,
                chunk = index,
                error = %err,
                "chunk failed"
            );
        }
    }

    fn on_chunk_progress(&self, index: usize, token: &CancellationToken, loaded: u64, total: u64) {
        let _emitting = self.emitting();
        let info = {
            let mut inner = self.lock();
            if token.is_cancelled() {
                return;
            }
            inner.chunks[index].record_progress(loaded, total);
            if !inner.state.is_running() || !inner.throttle.ready(Instant::now()) {
                return;
            }
            self.refresh_stats(&mut inner);
            self.snapshot(&inner)
        };
        self.emit(|l| l.on_progress(&info));
    }

    fn refresh_stats(&self, inner: &mut SessionInner) {
        let now = Instant::now();
        let fractions: Vec<f64> = inner.chunks.iter().map(Chunk::progress).collect();
        let speeds: Vec<f64> = inner
            .chunks
            .iter()
            .filter_map(|c| c.measure_speed(now))
            .collect();
        let uploaded: f64 = inner.chunks.iter().map(Chunk::size_uploaded).sum();

        let speed = file_speed(&speeds);
        inner.stats = StatsSnapshot {
            progress: file_progress(&fractions),
            speed,
            time_remaining: time_remaining(self.descriptor().size as f64 - uploaded, speed),
        };
    }

    fn snapshot(&self, inner: &SessionInner) -> SessionInfo {
        let descriptor = self.descriptor();
        SessionInfo {
            name: descriptor.name.clone(),
            size: descriptor.size,
            fingerprint: Some(self.fingerprint.clone()),
            state: inner.state,
            progress: inner.stats.progress,
            speed: inner.stats.speed,
            time_remaining: inner.stats.time_remaining,
            paused: inner.paused,
            message: inner.message.clone(),
        }
    }

    /// Current figures, recomputed now.
    pub fn info(&self) -> SessionInfo {
        let mut inner = self.lock();
        self.refresh_stats(&mut inner);
        self.snapshot(&inner)
    }

    /// Stops admitting queued chunks. Chunks already uploading finish.
    pub fn pause(&self) {
        let _emitting = self.emitting();
        let info = {
            let mut inner = self.lock();
            if matches!(
                inner.state,
                SessionState::Complete | SessionState::Cancelled
            ) {
                return;
            }
            self.scheduler.pause();
            inner.paused = true;
            if inner.state == SessionState::Active {
                inner.state = SessionState::Paused;
            }
            inner.message = "paused".into();
            self.snapshot(&inner)
        };
        tracing::info!(fingerprint = %self.fingerprint, "session paused");
        self.emit(|l| l.on_progress(&info));
    }

    /// Lets queued chunks proceed again.
    pub fn resume(&self) {
        let _emitting = self.emitting();
        let info = {
            let mut inner = self.lock();
            if !inner.paused {
                return;
            }
            self.scheduler.resume();
            inner.paused = false;
            if inner.state == SessionState::Paused {
                inner.state = SessionState::Active;
            }
            inner.message.clear();
            self.snapshot(&inner)
        };
        tracing::info!(fingerprint = %self.fingerprint, "session resumed");
        self.emit(|l| l.on_progress(&info));
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Aborts every in-flight chunk, stops the queued ones and asks the
    /// server to drop whatever it holds for this fingerprint.
    ///
    /// A complete session can still be cancelled while its owner has not
    /// merged it. Cancelling twice does nothing.
    pub async fn cancel(&self) -> Result<(), TransferError> {
        let halt = {
            let mut inner = self.lock();
            if inner.state == SessionState::Cancelled {
                return Ok(());
            }
            inner.state = SessionState::Cancelled;
            inner.message = "cancelled".into();
            let mut aborted = 0;
            for chunk in &mut inner.chunks {
                if chunk.abort() {
                    aborted += 1;
                }
            }
            tracing::info!(fingerprint = %self.fingerprint, aborted, "session cancelled");
            inner.halt.clone()
        };
        halt.cancel();

        let query = DeleteChunkQuery {
            fingerprint: self.fingerprint.to_string(),
            upload_folder_path: self.config.upload_folder_path.clone(),
        };
        if let Err(err) = self.endpoint.delete_chunks(query).await {
            tracing::warn!(
                fingerprint = %self.fingerprint,
                error = %err,
                "failed to delete server-side chunks"
            );
            return Err(err);
        }
        Ok(())
    }

    /// Puts failed and aborted chunks back to pending so the next
    /// [`run_all`](Self::run_all) re-submits them.
    pub fn retry(&self) -> Result<(), TransferError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Pending | SessionState::Error => {}
            other => {
                return Err(TransferError::SessionState(format!(
                    "cannot retry a {other} session"
                )));
            }
        }

        let mut reset = 0;
        for chunk in &mut inner.chunks {
            chunk.abort();
            if chunk.reset().is_ok() {
                reset += 1;
            }
        }
        inner.state = SessionState::Pending;
        inner.message.clear();
        self.refresh_stats(&mut inner);
        tracing::info!(fingerprint = %self.fingerprint, reset, "session reset for retry");
        Ok(())
    }

    /// Marks the session failed and notifies listeners.
    pub fn fail_with(&self, err: &TransferError) {
        let info = {
            let mut inner = self.lock();
            if inner.state == SessionState::Cancelled {
                return;
            }
            inner.state = SessionState::Error;
            inner.message = err.to_string();
            self.refresh_stats(&mut inner);
            self.snapshot(&inner)
        };
        tracing::error!(fingerprint = %self.fingerprint, error = %err, "upload failed");
        self.emit(|l| l.on_failure(&info, err));
    }

    /// Completes without uploading; the server already has the file.
    pub fn complete_skipped(&self, message: impl Into<String>) -> Result<(), TransferError> {
        let info = {
            let mut inner = self.lock();
            if inner.state.is_running() {
                return Err(TransferError::SessionState(
                    "cannot skip a running session".into(),
                ));
            }
            for chunk in &mut inner.chunks {
                if chunk.status() == ChunkStatus::Pending {
                    chunk.mark_uploaded()?;
                }
            }
            inner.state = SessionState::Complete;
            inner.message = message.into();
            self.refresh_stats(&mut inner);
            self.snapshot(&inner)
        };
        tracing::info!(fingerprint = %self.fingerprint, "upload skipped, file already stored");
        self.emit(|l| l.on_success(&info));
        Ok(())
    }

    /// Replaces the status message.
    pub fn set_message(&self, message: impl Into<String>) {
        self.lock().message = message.into();
    }

    /// Body of the merge request for this file.
    pub fn merge_info(&self) -> UploadedFileInfo {
        let descriptor = self.descriptor();
        UploadedFileInfo {
            name: descriptor.name.clone(),
            size: descriptor.size,
            file_type: descriptor.content_type.clone(),
            relative_path: descriptor.relative_path.clone(),
            unique_identifier: self.fingerprint.to_string(),
        }
    }
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("name", &self.descriptor().name)
            .field("fingerprint", &self.fingerprint)
            .field("state", &self.state())
            .finish()
    }
}
