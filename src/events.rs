//! Progress notifications for front ends.
//!
//! The engine publishes [`ProgressEvent`]s on a `tokio::sync::broadcast`
//! channel. Any number of subscribers may listen; a subscriber that falls
//! behind loses the oldest events (reported as `RecvError::Lagged`) and never
//! slows the transfers down. Events about one file are emitted by one worker
//! at a time, so they arrive in causal order.

use serde::Serialize;
use tokio::sync::broadcast;

/// Default channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobStarted,
    ManifestResolved,
    ManifestUnavailable,
    FileStarted,
    FileProgress,
    FileRetrying,
    FileCompleted,
    FileSkipped,
    FileFailed,
    FileCancelled,
    WorkersScaled,
    DiskFull,
    OrphanFound,
    OrphanDeleted,
    DeleteFailed,
    MissingFile,
    JobFinished,
}

/// One notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub item_id: Option<String>,
    pub file_name: Option<String>,
    pub bytes_done: u64,
    pub total_bytes: Option<u64>,
    pub message: Option<String>,
}

impl ProgressEvent {
    /// Event not tied to any item.
    #[must_use]
    pub fn job(kind: EventKind) -> Self {
        Self {
            kind,
            item_id: None,
            file_name: None,
            bytes_done: 0,
            total_bytes: None,
            message: None,
        }
    }

    /// Event about a whole item.
    #[must_use]
    pub fn item(kind: EventKind, item_id: impl Into<String>) -> Self {
        Self {
            item_id: Some(item_id.into()),
            ..Self::job(kind)
        }
    }

    /// Event about one file.
    #[must_use]
    pub fn file(kind: EventKind, item_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            item_id: Some(item_id.into()),
            file_name: Some(file_name.into()),
            ..Self::job(kind)
        }
    }

    #[must_use]
    pub fn with_bytes(mut self, bytes_done: u64, total_bytes: Option<u64>) -> Self {
        self.bytes_done = bytes_done;
        self.total_bytes = total_bytes;
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Fan-out publisher of [`ProgressEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Opens a new subscription that sees events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Without subscribers the event is dropped.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}
