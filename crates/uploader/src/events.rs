//! Listener surface of the [`TransferManager`](crate::TransferManager).

use std::sync::Arc;

use chunkup_transfer::{SessionInfo, TransferError};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// Observer of every file handled by a manager.
///
/// All methods default to no-ops. Calls are made from whichever task
/// produced the event, never while internal locks are held.
pub trait TransferListener: Send + Sync {
    /// A file passed validation and was queued.
    fn on_added(&self, _info: &SessionInfo) {}

    fn on_progress(&self, _info: &SessionInfo) {}

    /// Uploaded and merged, or already stored on the server.
    fn on_success(&self, _info: &SessionInfo) {}

    /// Validation or transfer failure.
    fn on_failure(&self, _info: &SessionInfo, _error: &TransferError) {}

    /// Same content already queued or uploading; nothing was added.
    fn on_duplicate(&self, _info: &SessionInfo) {}

    fn on_cancelled(&self, _info: &SessionInfo) {}
}

/// Event emitted through an [`EventChannel`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferEvent {
    Added { info: SessionInfo },
    Progress { info: SessionInfo },
    Succeeded { info: SessionInfo },
    Failed { info: SessionInfo, error: String },
    Duplicate { info: SessionInfo },
    Cancelled { info: SessionInfo },
}

impl TransferEvent {
    pub fn info(&self) -> &SessionInfo {
        match self {
            Self::Added { info }
            | Self::Progress { info }
            | Self::Succeeded { info }
            | Self::Failed { info, .. }
            | Self::Duplicate { info }
            | Self::Cancelled { info } => info,
        }
    }

    /// `true` for events after which the file is no longer tracked.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

/// Listener that forwards every call into a bounded channel.
///
/// Events are dropped with a warning when the receiver lags behind.
pub struct EventChannel {
    tx: mpsc::Sender<TransferEvent>,
}

impl EventChannel {
    /// Creates the listener and the receiving end.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: TransferEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("failed to forward transfer event: {e}");
        }
    }
}

impl TransferListener for EventChannel {
    fn on_added(&self, info: &SessionInfo) {
        self.send(TransferEvent::Added { info: info.clone() });
    }

    fn on_progress(&self, info: &SessionInfo) {
        self.send(TransferEvent::Progress { info: info.clone() });
    }

    fn on_success(&self, info: &SessionInfo) {
        self.send(TransferEvent::Succeeded { info: info.clone() });
    }

    fn on_failure(&self, info: &SessionInfo, error: &TransferError) {
        self.send(TransferEvent::Failed {
            info: info.clone(),
            error: error.to_string(),
        });
    }

    fn on_duplicate(&self, info: &SessionInfo) {
        self.send(TransferEvent::Duplicate { info: info.clone() });
    }

    fn on_cancelled(&self, info: &SessionInfo) {
        self.send(TransferEvent::Cancelled { info: info.clone() });
    }
}
