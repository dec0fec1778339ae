//! Multi-file upload queue.
//!
//! The [`TransferManager`] accepts files, validates and fingerprints them,
//! rejects duplicates, and drives each accepted file through skip-check,
//! chunk upload and merge. At most `max_active_files` files upload at once;
//! across all of them at most `max_concurrent_chunks` chunk requests are in
//! flight.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use chunkup_protocol::SkipCheckQuery;
use chunkup_transfer::{
    ChunkScheduler, FileRules, FileSource, Fingerprint, SessionConfig, SessionInfo,
    SessionListener, SessionState, TransferError, TransferSession, UploadEndpoint,
    fingerprint_with, validate_file,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::events::TransferListener;
use crate::http::HttpEndpoint;

/// Result of [`TransferManager::add_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The file was queued under this fingerprint.
    Queued(Fingerprint),
    /// A file with the same fingerprint is already queued or uploading.
    Duplicate(Fingerprint),
}

impl AddOutcome {
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            Self::Queued(fp) | Self::Duplicate(fp) => fp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for an explicit start.
    Held,
    /// Waiting for an active-file slot.
    Ready,
    Running,
}

struct Entry {
    session: Arc<TransferSession>,
    phase: Phase,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Entry>,
    /// Sessions that failed; kept until retried, cancelled or re-added.
    failed: HashMap<Fingerprint, Arc<TransferSession>>,
}

impl QueueState {
    fn position(&self, fp: &Fingerprint) -> Option<usize> {
        self.queue.iter().position(|e| e.session.fingerprint() == fp)
    }

    fn find(&self, fp: &Fingerprint) -> Option<Arc<TransferSession>> {
        self.position(fp)
            .map(|i| Arc::clone(&self.queue[i].session))
            .or_else(|| self.failed.get(fp).cloned())
    }

    /// Files that will finish without further calls.
    fn outstanding(&self) -> usize {
        self.queue.iter().filter(|e| e.phase != Phase::Held).count()
    }
}

struct ManagerInner {
    config: UploaderConfig,
    session_config: SessionConfig,
    rules: FileRules,
    endpoint: Arc<dyn UploadEndpoint>,
    scheduler: Arc<ChunkScheduler>,
    listeners: RwLock<Vec<Arc<dyn TransferListener>>>,
    state: Mutex<QueueState>,
    idle: watch::Sender<usize>,
}

/// Queue of file uploads sharing one endpoint.
///
/// Cheap to clone; clones share the same queue. Methods that may start
/// uploads spawn tasks and must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

impl TransferManager {
    pub fn new(
        config: UploaderConfig,
        endpoint: Arc<dyn UploadEndpoint>,
    ) -> Result<Self, UploadError> {
        config.validate()?;
        let (idle, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                session_config: config.session_config(),
                rules: config.file_rules(),
                scheduler: ChunkScheduler::new(config.max_concurrent_chunks),
                endpoint,
                config,
                listeners: RwLock::new(Vec::new()),
                state: Mutex::new(QueueState::default()),
                idle,
            }),
        })
    }

    /// Creates a manager talking to the configured HTTP server.
    pub fn with_http(config: UploaderConfig) -> Result<Self, UploadError> {
        let endpoint = HttpEndpoint::new(&config)?;
        Self::new(config, Arc::new(endpoint))
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.inner.config
    }

    pub fn add_listener(&self, listener: Arc<dyn TransferListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Validates, fingerprints and queues one file.
    ///
    /// Rejected files are reported to listeners through `on_failure` and
    /// returned as errors. Duplicates are reported through `on_duplicate`.
    pub async fn add_file(&self, source: Arc<dyn FileSource>) -> Result<AddOutcome, TransferError> {
        let inner = &self.inner;
        let descriptor = source.descriptor().clone();

        if let Err(err) = validate_file(&descriptor, &inner.rules) {
            warn!(name = %descriptor.name, error = %err, "file rejected");
            let info = SessionInfo::unstarted(&descriptor, err.to_string());
            inner.emit(|l| l.on_failure(&info, &err));
            return Err(err);
        }

        let fp = match fingerprint_with(
            source.as_ref(),
            inner.config.chunk_size,
            inner.config.fingerprint_strategy,
        )
        .await
        {
            Ok(fp) => fp,
            Err(err) => {
                warn!(name = %descriptor.name, error = %err, "failed to fingerprint file");
                let info = SessionInfo::unstarted(&descriptor, err.to_string());
                inner.emit(|l| l.on_failure(&info, &err));
                return Err(err);
            }
        };

        let session = Arc::new(
            TransferSession::new(
                source,
                fp.clone(),
                Arc::clone(&inner.endpoint),
                inner.session_config.clone(),
            )
            .with_shared_scheduler(Arc::clone(&inner.scheduler)),
        );
        session.add_listener(Arc::new(ProgressForwarder {
            manager: Arc::downgrade(inner),
        }));

        let phase = if inner.config.auto_start {
            Phase::Ready
        } else {
            Phase::Held
        };
        let queued = {
            let mut state = inner.lock();
            if state.position(&fp).is_some() {
                false
            } else {
                state.failed.remove(&fp);
                state.queue.push_back(Entry {
                    session: Arc::clone(&session),
                    phase,
                });
                true
            }
        };

        if !queued {
            session.set_message("already queued");
            let info = session.info();
            info!(name = %descriptor.name, fingerprint = %fp, "duplicate file ignored");
            inner.emit(|l| l.on_duplicate(&info));
            return Ok(AddOutcome::Duplicate(fp));
        }

        info!(name = %descriptor.name, size = descriptor.size, fingerprint = %fp, "file queued");
        let info = session.info();
        inner.emit(|l| l.on_added(&info));
        inner.update_idle();
        inner.pump();
        Ok(AddOutcome::Queued(fp))
    }

    /// Adds files one after another, returning one outcome per file.
    pub async fn add_files(
        &self,
        sources: Vec<Arc<dyn FileSource>>,
    ) -> Vec<Result<AddOutcome, TransferError>> {
        let mut outcomes = Vec::with_capacity(sources.len());
        for source in sources {
            outcomes.push(self.add_file(source).await);
        }
        outcomes
    }

    /// Releases a held file for upload.
    pub fn start(&self, fp: &Fingerprint) -> Result<(), UploadError> {
        {
            let mut state = self.inner.lock();
            let i = state
                .position(fp)
                .ok_or_else(|| UploadError::UnknownFile(fp.clone()))?;
            let entry = &mut state.queue[i];
            if entry.phase == Phase::Held {
                entry.phase = Phase::Ready;
            }
        }
        self.inner.update_idle();
        self.inner.pump();
        Ok(())
    }

    /// Releases every held file.
    pub fn start_all(&self) {
        {
            let mut state = self.inner.lock();
            for entry in state.queue.iter_mut().filter(|e| e.phase == Phase::Held) {
                entry.phase = Phase::Ready;
            }
        }
        self.inner.update_idle();
        self.inner.pump();
    }

    pub fn pause(&self, fp: &Fingerprint) -> Result<(), UploadError> {
        self.queued_session(fp)?.pause();
        Ok(())
    }

    pub fn resume(&self, fp: &Fingerprint) -> Result<(), UploadError> {
        self.queued_session(fp)?.resume();
        Ok(())
    }

    /// Stops chunk admission for every file.
    pub fn pause_all(&self) {
        self.inner.scheduler.pause();
        for session in self.queued_sessions() {
            session.pause();
        }
        info!("all uploads paused");
    }

    pub fn resume_all(&self) {
        for session in self.queued_sessions() {
            session.resume();
        }
        self.inner.scheduler.resume();
        info!("all uploads resumed");
    }

    /// Removes a file from the queue, aborts its chunks and asks the server
    /// to drop what it stored. Listeners receive `on_cancelled`.
    pub async fn cancel(&self, fp: &Fingerprint) -> Result<(), UploadError> {
        let session = {
            let mut state = self.inner.lock();
            match state.position(fp) {
                Some(i) => state.queue.remove(i).map(|e| e.session),
                None => state.failed.remove(fp),
            }
        }
        .ok_or_else(|| UploadError::UnknownFile(fp.clone()))?;
        self.inner.update_idle();

        let result = session.cancel().await;
        let info = session.info();
        self.inner.emit(|l| l.on_cancelled(&info));
        self.inner.pump();
        result.map_err(UploadError::from)
    }

    /// Re-queues a failed file. Chunks already accepted by the server are
    /// not sent again.
    pub fn retry(&self, fp: &Fingerprint) -> Result<(), UploadError> {
        {
            let mut state = self.inner.lock();
            let session = state
                .failed
                .remove(fp)
                .ok_or_else(|| UploadError::UnknownFile(fp.clone()))?;
            if let Err(err) = session.retry() {
                state.failed.insert(fp.clone(), session);
                return Err(err.into());
            }
            info!(fingerprint = %fp, "upload re-queued");
            state.queue.push_back(Entry {
                session,
                phase: Phase::Ready,
            });
        }
        self.inner.update_idle();
        self.inner.pump();
        Ok(())
    }

    pub fn session_info(&self, fp: &Fingerprint) -> Option<SessionInfo> {
        let session = self.inner.lock().find(fp);
        session.map(|s| s.info())
    }

    /// Every tracked file: the queue in order, then failed files.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<TransferSession>> = {
            let state = self.inner.lock();
            state
                .queue
                .iter()
                .map(|e| Arc::clone(&e.session))
                .chain(state.failed.values().cloned())
                .collect()
        };
        sessions.iter().map(|s| s.info()).collect()
    }

    /// Fingerprints of files that failed and can be retried.
    pub fn failed(&self) -> Vec<Fingerprint> {
        self.inner.lock().failed.keys().cloned().collect()
    }

    /// Waits until no started or startable file remains. Held files are
    /// not waited for.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.idle.subscribe();
        let _ = rx.wait_for(|outstanding| *outstanding == 0).await;
    }

    fn queued_session(&self, fp: &Fingerprint) -> Result<Arc<TransferSession>, UploadError> {
        let state = self.inner.lock();
        state
            .position(fp)
            .map(|i| Arc::clone(&state.queue[i].session))
            .ok_or_else(|| UploadError::UnknownFile(fp.clone()))
    }

    fn queued_sessions(&self) -> Vec<Arc<TransferSession>> {
        self.inner
            .lock()
            .queue
            .iter()
            .map(|e| Arc::clone(&e.session))
            .collect()
    }
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TransferManager")
            .field("queued", &state.queue.len())
            .field("failed", &state.failed.len())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, f: impl Fn(&dyn TransferListener)) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for l in &listeners {
            f(l.as_ref());
        }
    }

    fn update_idle(&self) {
        let outstanding = self.lock().outstanding();
        self.idle.send_replace(outstanding);
    }

    /// Starts ready files, in queue order, while active slots remain.
    fn pump(self: &Arc<Self>) {
        let starting: Vec<Arc<TransferSession>> = {
            let mut state = self.lock();
            let running = state
                .queue
                .iter()
                .filter(|e| e.phase == Phase::Running)
                .count();
            let free = self.config.max_active_files.saturating_sub(running);
            state
                .queue
                .iter_mut()
                .filter(|e| e.phase == Phase::Ready)
                .take(free)
                .map(|e| {
                    e.phase = Phase::Running;
                    Arc::clone(&e.session)
                })
                .collect()
        };

        for session in starting {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.drive(session).await });
        }
    }

    async fn drive(self: Arc<Self>, session: Arc<TransferSession>) {
        let fp = session.fingerprint().clone();
        debug!(fingerprint = %fp, "upload started");

        match self.transfer(&session).await {
            Ok(()) => {
                // A file cancelled during its merge is no longer queued and
                // the canceller already reported it.
                if self.remove(&fp, &session) && !session.is_cancelled() {
                    let info = session.info();
                    info!(name = %info.name, fingerprint = %fp, "upload complete");
                    self.emit(|l| l.on_success(&info));
                } else {
                    debug!(fingerprint = %fp, "upload cancelled during merge");
                }
            }
            Err(err) if err.is_aborted() || session.is_cancelled() => {
                // Cancelled; the canceller already removed and reported it.
                self.remove(&fp, &session);
                debug!(fingerprint = %fp, "upload stopped");
            }
            Err(err) => {
                if session.state() != SessionState::Error {
                    session.fail_with(&err);
                }
                let retained = {
                    let mut state = self.lock();
                    match state.position(&fp) {
                        Some(i) if Arc::ptr_eq(&state.queue[i].session, &session) => {
                            state.queue.remove(i);
                            state.failed.insert(fp.clone(), Arc::clone(&session));
                            true
                        }
                        _ => false,
                    }
                };
                if retained {
                    let info = session.info();
                    self.emit(|l| l.on_failure(&info, &err));
                }
            }
        }

        self.update_idle();
        self.pump();
    }

    /// Drops `session` from the queue. Returns `false` if someone else
    /// already did.
    fn remove(&self, fp: &Fingerprint, session: &Arc<TransferSession>) -> bool {
        let mut state = self.lock();
        if let Some(i) = state.position(fp)
            && Arc::ptr_eq(&state.queue[i].session, session)
        {
            state.queue.remove(i);
            return true;
        }
        false
    }

    /// Skip-check, chunk upload and merge for one file.
    async fn transfer(&self, session: &Arc<TransferSession>) -> Result<(), TransferError> {
        let descriptor = session.descriptor();
        let folder = self.session_config.upload_folder_path.clone();

        let check = self
            .endpoint
            .skip_check(SkipCheckQuery {
                fingerprint: session.fingerprint().to_string(),
                filename: descriptor.name.clone(),
                upload_folder_path: folder.clone(),
            })
            .await?;
        if session.is_cancelled() {
            return Err(TransferError::Aborted);
        }
        if check.skip_upload {
            return session.complete_skipped("already uploaded");
        }

        session.generate_chunks(check.uploaded_chunk_list.len())?;
        session.run_all().await?;

        session.set_message("merging");
        let merged = self.endpoint.merge(session.merge_info(), folder).await?;
        if session.is_cancelled() {
            return Err(TransferError::Aborted);
        }
        if let Some(result) = merged
            && !result.is_success(&self.session_config.success_codes)
        {
            return Err(TransferError::Application {
                code: result.code,
                message: result.message,
            });
        }
        session.set_message("merged");
        Ok(())
    }
}

/// Relays session progress to the manager's listeners. Terminal events are
/// reported by the manager itself once skip-check and merge are done.
struct ProgressForwarder {
    manager: Weak<ManagerInner>,
}

impl SessionListener for ProgressForwarder {
    fn on_progress(&self, info: &SessionInfo) {
        if let Some(manager) = self.manager.upgrade() {
            manager.emit(|l| l.on_progress(info));
        }
    }
}
