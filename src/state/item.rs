//! Task types and status definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Target file exists with the recorded byte count.
    Completed,
    /// Permanent failure, or retries exhausted.
    Failed,
    /// Not transferred: already present locally, or no longer selected.
    Skipped,
}

impl TaskStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::Skipped,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Returns true for statuses a run never revisits on its own.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

/// Identity of a task: one per `(item_id, file_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub item_id: String,
    pub file_name: String,
}

impl TaskKey {
    #[must_use]
    pub fn new(item_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            file_name: file_name.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_id, self.file_name)
    }
}

/// Registration input for a selected remote file.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub key: TaskKey,
    /// Absolute local destination.
    pub target_path: PathBuf,
    /// Size declared by the manifest, when known.
    pub size_bytes: Option<u64>,
}

/// A single persisted download task.
#[derive(Debug, Clone, FromRow)]
pub struct DownloadTask {
    /// Archival item identifier.
    pub item_id: String,
    /// File name as listed in the manifest (may contain `/`).
    pub file_name: String,
    /// Local destination path.
    pub target_path: String,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Number of claims made for this task.
    pub attempts: i64,
    /// Bytes present in the partial or final file.
    pub bytes_done: i64,
    /// Declared size when known.
    pub size_bytes: Option<i64>,
    /// Last error message if failed or retried.
    pub last_error: Option<String>,
    /// Unix milliseconds before which the task must not be claimed.
    pub not_before: i64,
    /// When the task was created.
    pub created_at: String,
    /// When the task was last updated.
    pub updated_at: String,
}

impl DownloadTask {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Pending` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status_str.parse().unwrap_or(TaskStatus::Pending)
    }

    #[must_use]
    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.item_id, &self.file_name)
    }

    #[must_use]
    pub fn target_path(&self) -> PathBuf {
        PathBuf::from(&self.target_path)
    }

    /// Path of the in-flight temporary file next to the target.
    #[must_use]
    pub fn part_path(&self) -> PathBuf {
        part_path_for(&self.target_path())
    }

    /// Declared size as unsigned, ignoring negative garbage.
    #[must_use]
    pub fn expected_size(&self) -> Option<u64> {
        self.size_bytes.and_then(|size| u64::try_from(size).ok())
    }
}

/// Appends `.part` to the file name of `target`.
#[must_use]
pub fn part_path_for(target: &std::path::Path) -> PathBuf {
    let mut name = target.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl StatusCounts {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed + self.skipped
    }

    pub(crate) fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::InProgress => self.in_progress += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Skipped => self.skipped += count,
        }
    }
}
