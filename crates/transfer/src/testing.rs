//! Test doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chunkup_protocol::{
    ApiResult, ChunkResult, DEFAULT_SUCCESS_CODE, DeleteChunkQuery, SkipCheckQuery,
    UploadedFileInfo,
};
use tokio::sync::Semaphore;

use crate::TransferError;
use crate::endpoint::{ChunkUpload, EndpointFuture, ProgressFn, UploadEndpoint};
use crate::session::{SessionInfo, SessionListener};

/// Polls `cond` until it holds, failing the test after 5 seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Scriptable in-memory endpoint.
///
/// Behaviour is keyed by 1-based chunk number and applies to every file.
#[derive(Default)]
pub struct MockEndpoint {
    codes: Mutex<HashMap<u32, i64>>,
    network_failures: Mutex<HashMap<u32, u32>>,
    gates: Mutex<HashMap<u32, Arc<Semaphore>>>,
    delay: Mutex<Option<Duration>>,
    uploads: Mutex<Vec<u32>>,
    deleted: Mutex<Vec<String>>,
    bytes: AtomicUsize,
    completed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answers chunk `n` with `code`.
    pub fn respond(&self, n: u32, code: i64) {
        self.codes.lock().unwrap().insert(n, code);
    }

    /// Fails the next `times` uploads of chunk `n` at the transport level.
    pub fn fail_network(&self, n: u32, times: u32) {
        self.network_failures.lock().unwrap().insert(n, times);
    }

    /// Holds uploads of chunk `n` until a permit is added to the returned gate.
    pub fn gate(&self, n: u32) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().unwrap().insert(n, Arc::clone(&gate));
        gate
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Chunk numbers in the order their uploads started.
    pub fn uploads(&self) -> Vec<u32> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Uploads that produced a response.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl UploadEndpoint for MockEndpoint {
    fn skip_check(&self, _query: SkipCheckQuery) -> EndpointFuture<'_, ChunkResult> {
        Box::pin(async move { Ok(ChunkResult::default()) })
    }

    fn upload_chunk(
        &self,
        upload: ChunkUpload,
        progress: ProgressFn,
    ) -> EndpointFuture<'_, ApiResult> {
        Box::pin(async move {
            let n = upload.form.chunk_number;
            self.uploads.lock().unwrap().push(n);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            let gate = self.gates.lock().unwrap().get(&n).cloned();
            if let Some(gate) = gate
                && let Ok(permit) = gate.acquire().await
            {
                permit.forget();
            }
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let len = upload.data.len() as u64;
            progress(len / 2, len);
            progress(len, len);
            self.bytes.fetch_add(upload.data.len(), Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);

            {
                let mut failures = self.network_failures.lock().unwrap();
                if let Some(left) = failures.get_mut(&n)
                    && *left > 0
                {
                    *left -= 1;
                    return Err(TransferError::Network("connection reset".into()));
                }
            }

            let code = self
                .codes
                .lock()
                .unwrap()
                .get(&n)
                .copied()
                .unwrap_or(DEFAULT_SUCCESS_CODE);
            if code == DEFAULT_SUCCESS_CODE {
                Ok(ApiResult::success())
            } else {
                Ok(ApiResult::error(code, "upload failed"))
            }
        })
    }

    fn delete_chunks(&self, query: DeleteChunkQuery) -> EndpointFuture<'_, ()> {
        Box::pin(async move {
            self.deleted.lock().unwrap().push(query.fingerprint);
            Ok(())
        })
    }

    fn merge(
        &self,
        _info: UploadedFileInfo,
        _upload_folder_path: String,
    ) -> EndpointFuture<'_, Option<ApiResult>> {
        Box::pin(async move { Ok(Some(ApiResult::success())) })
    }
}

/// Listener that records what it was told.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
    progress: Mutex<Vec<u8>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn progress(&self) -> Vec<u8> {
        self.progress.lock().unwrap().clone()
    }
}

impl SessionListener for RecordingListener {
    fn on_progress(&self, info: &SessionInfo) {
        self.progress.lock().unwrap().push(info.progress);
    }

    fn on_success(&self, info: &SessionInfo) {
        self.progress.lock().unwrap().push(info.progress);
        self.events.lock().unwrap().push("success".into());
    }

    fn on_failure(&self, _info: &SessionInfo, error: &TransferError) {
        self.events.lock().unwrap().push(format!("failure: {error}"));
    }
}
