//! Durable job state: one [`DownloadTask`] per `(item_id, file_name)`.
//!
//! The [`StateStore`] is the sole owner of task status. Every transition is a
//! single SQL statement, so concurrent workers observe linearizable updates,
//! and a crash leaves each row in either its old or its new state.
//!
//! # Lifecycle
//!
//! ```text
//! pending ──claim──▶ in_progress ──▶ completed
//!    ▲                    │    └────▶ failed
//!    └──── requeue ───────┘
//! pending/failed ──▶ skipped   (sync hit or no longer selected)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use grabia_core::state::{NewTask, StateStore, TaskKey};
//!
//! let store = StateStore::open(Path::new("./mirror")).await?;
//! store.register(&NewTask { key: TaskKey::new("item", "a.mp3"), target_path, size_bytes: Some(10) }).await?;
//! if let Some(task) = store.claim_next(now_millis()).await? {
//!     // ... download ...
//!     store.mark_completed(&task.key(), 10).await?;
//! }
//! ```

mod error;
mod item;
mod repository;

pub use error::{StateDbErrorKind, StateError};
pub use item::{DownloadTask, NewTask, StatusCounts, TaskKey, TaskStatus, part_path_for};
pub use repository::TaskRepository;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::db::Database;

/// Directory under the output root holding the state database.
pub const STATE_DIR_NAME: &str = ".grabia";

/// State database file name.
pub const STATE_DB_FILE: &str = "state.db";

const SETTINGS_KEY: &str = "settings";
const THROUGHPUT_KEY: &str = "throughput";

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Persisted mapping of task key to task.
pub type JobState = BTreeMap<TaskKey, DownloadTask>;

/// Last aggregate throughput observed by a running engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub bytes_per_sec: f64,
    pub recorded_at_ms: i64,
}

/// Current wall clock in Unix milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}

/// Path of the state database for an output directory.
#[must_use]
pub fn state_db_path(output_dir: &Path) -> PathBuf {
    output_dir.join(STATE_DIR_NAME).join(STATE_DB_FILE)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Returns [`StateError::TaskNotFound`] when an update touched no row.
fn check_affected(key: &TaskKey, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StateError::TaskNotFound(key.to_string()))
    } else {
        Ok(())
    }
}

/// SQLite-backed task store.
#[derive(Debug, Clone)]
pub struct StateStore {
    db: Database,
}

impl StateStore {
    /// Wraps an already opened database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Opens (creating if needed) the state database under `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corruption`] when the existing file is damaged,
    /// or [`StateError::Database`] for other open failures.
    #[instrument(skip(output_dir), fields(output_dir = %output_dir.display()))]
    pub async fn open(output_dir: &Path) -> Result<Self> {
        let path = state_db_path(output_dir);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| StateError::Database {
                kind: StateDbErrorKind::Io,
                message: format!("creating {}: {err}", parent.display()),
            })?;
        }
        let db = Database::new(&path).await?;
        debug!(path = %path.display(), "state store opened");
        Ok(Self { db })
    }

    /// Opens an existing state database, returning `None` when none exists.
    ///
    /// # Errors
    ///
    /// Same as [`StateStore::open`].
    pub async fn open_existing(output_dir: &Path) -> Result<Option<Self>> {
        if !state_db_path(output_dir).is_file() {
            return Ok(None);
        }
        Self::open(output_dir).await.map(Some)
    }

    /// Creates a store backed by an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the database cannot be created.
    pub async fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::new_in_memory().await?))
    }

    /// Loads the full job state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<JobState> {
        let tasks = self.all().await?;
        Ok(tasks.into_iter().map(|task| (task.key(), task)).collect())
    }

    /// Returns every task in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    pub async fn all(&self) -> Result<Vec<DownloadTask>> {
        let tasks = sqlx::query_as::<_, DownloadTask>(r"SELECT * FROM tasks ORDER BY rowid ASC")
            .fetch_all(self.db.pool())
            .await?;
        Ok(tasks)
    }

    /// Returns the tasks of one item in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn query(&self, item_id: &str) -> Result<Vec<DownloadTask>> {
        let tasks = sqlx::query_as::<_, DownloadTask>(
            r"SELECT * FROM tasks WHERE item_id = ? ORDER BY rowid ASC",
        )
        .bind(item_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(tasks)
    }

    /// Gets one task by key.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    pub async fn get(&self, key: &TaskKey) -> Result<Option<DownloadTask>> {
        let task = sqlx::query_as::<_, DownloadTask>(
            r"SELECT * FROM tasks WHERE item_id = ? AND file_name = ?",
        )
        .bind(&key.item_id)
        .bind(&key.file_name)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(task)
    }

    /// Registers a selected file, keeping the status of an existing task.
    ///
    /// The target path and declared size are refreshed from the latest
    /// manifest. Returns the stored task.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the upsert fails.
    #[instrument(skip(self, task), fields(key = %task.key))]
    pub async fn register(&self, task: &NewTask) -> Result<DownloadTask> {
        let stored = sqlx::query_as::<_, DownloadTask>(
            r"INSERT INTO tasks (item_id, file_name, target_path, status, size_bytes)
              VALUES (?, ?, ?, ?, ?)
              ON CONFLICT (item_id, file_name) DO UPDATE SET
                  target_path = excluded.target_path,
                  size_bytes = COALESCE(excluded.size_bytes, tasks.size_bytes),
                  updated_at = datetime('now')
              RETURNING *",
        )
        .bind(&task.key.item_id)
        .bind(&task.key.file_name)
        .bind(task.target_path.to_string_lossy().as_ref())
        .bind(TaskStatus::Pending.as_str())
        .bind(task.size_bytes.map(to_i64))
        .fetch_one(self.db.pool())
        .await?;
        Ok(stored)
    }

    /// Inserts or replaces a task in one atomic statement.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the upsert fails.
    #[instrument(skip(self, task), fields(item_id = %task.item_id, file_name = %task.file_name))]
    pub async fn upsert(&self, task: &DownloadTask) -> Result<()> {
        sqlx::query(
            r"INSERT INTO tasks (
                item_id, file_name, target_path, status, attempts,
                bytes_done, size_bytes, last_error, not_before
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT (item_id, file_name) DO UPDATE SET
                  target_path = excluded.target_path,
                  status = excluded.status,
                  attempts = excluded.attempts,
                  bytes_done = excluded.bytes_done,
                  size_bytes = excluded.size_bytes,
                  last_error = excluded.last_error,
                  not_before = excluded.not_before,
                  updated_at = datetime('now')",
        )
        .bind(&task.item_id)
        .bind(&task.file_name)
        .bind(&task.target_path)
        .bind(task.status().as_str())
        .bind(task.attempts)
        .bind(task.bytes_done)
        .bind(task.size_bytes)
        .bind(task.last_error.as_deref())
        .bind(task.not_before)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Atomically claims the next ready pending task.
    ///
    /// The task moves to `in_progress` and its attempt counter is incremented
    /// in the same statement, so two claimers can never own the same task.
    /// Tasks whose `not_before` lies after `now_ms` are not eligible.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn claim_next(&self, now_ms: i64) -> Result<Option<DownloadTask>> {
        let task = sqlx::query_as::<_, DownloadTask>(
            r"UPDATE tasks
              SET status = ?, attempts = attempts + 1, updated_at = datetime('now')
              WHERE rowid = (
                  SELECT rowid FROM tasks
                  WHERE status = ? AND not_before <= ?
                  ORDER BY not_before ASC, rowid ASC
                  LIMIT 1
              ) AND status = ?
              RETURNING *",
        )
        .bind(TaskStatus::InProgress.as_str())
        .bind(TaskStatus::Pending.as_str())
        .bind(now_ms)
        .bind(TaskStatus::Pending.as_str())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(task)
    }

    /// Earliest `not_before` among pending tasks, or `None` when none are pending.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    pub async fn next_ready_at(&self) -> Result<Option<i64>> {
        let row = sqlx::query(r"SELECT MIN(not_before) AS ready_at FROM tasks WHERE status = ?")
            .bind(TaskStatus::Pending.as_str())
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.get::<Option<i64>, _>("ready_at"))
    }

    /// Returns a claimed task to pending.
    ///
    /// `not_before_ms` gates the next claim. With `refund_attempt` the claim
    /// does not count against the retry ceiling (used on cancellation).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::TaskNotFound`] if no task has the key.
    #[instrument(skip(self, error), fields(key = %key))]
    pub async fn requeue(
        &self,
        key: &TaskKey,
        error: Option<&str>,
        not_before_ms: i64,
        refund_attempt: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET status = ?,
                  last_error = COALESCE(?, last_error),
                  not_before = ?,
                  attempts = CASE WHEN ? THEN MAX(attempts - 1, 0) ELSE attempts END,
                  updated_at = datetime('now')
              WHERE item_id = ? AND file_name = ?",
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(error)
        .bind(not_before_ms)
        .bind(refund_attempt)
        .bind(&key.item_id)
        .bind(&key.file_name)
        .execute(self.db.pool())
        .await?;
        check_affected(key, result.rows_affected())
    }

    /// Marks a task completed with its final byte count.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::TaskNotFound`] if no task has the key.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn mark_completed(&self, key: &TaskKey, bytes: u64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET status = ?, bytes_done = ?, size_bytes = COALESCE(size_bytes, ?),
                  last_error = NULL, not_before = 0, updated_at = datetime('now')
              WHERE item_id = ? AND file_name = ?",
        )
        .bind(TaskStatus::Completed.as_str())
        .bind(to_i64(bytes))
        .bind(to_i64(bytes))
        .bind(&key.item_id)
        .bind(&key.file_name)
        .execute(self.db.pool())
        .await?;
        check_affected(key, result.rows_affected())
    }

    /// Marks a task failed with an error message.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::TaskNotFound`] if no task has the key.
    #[instrument(skip(self, error), fields(key = %key))]
    pub async fn mark_failed(&self, key: &TaskKey, error: &str) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET status = ?, last_error = ?, updated_at = datetime('now')
              WHERE item_id = ? AND file_name = ?",
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(error)
        .bind(&key.item_id)
        .bind(&key.file_name)
        .execute(self.db.pool())
        .await?;
        check_affected(key, result.rows_affected())
    }

    /// Marks a task skipped, recording the bytes present on disk.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::TaskNotFound`] if no task has the key.
    #[instrument(skip(self, reason), fields(key = %key))]
    pub async fn mark_skipped(&self, key: &TaskKey, bytes_done: u64, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET status = ?, bytes_done = ?, last_error = ?, not_before = 0,
                  updated_at = datetime('now')
              WHERE item_id = ? AND file_name = ?",
        )
        .bind(TaskStatus::Skipped.as_str())
        .bind(to_i64(bytes_done))
        .bind(reason)
        .bind(&key.item_id)
        .bind(&key.file_name)
        .execute(self.db.pool())
        .await?;
        check_affected(key, result.rows_affected())
    }

    /// Resets a task to pending with a fresh attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::TaskNotFound`] if no task has the key.
    pub async fn reset_to_pending(&self, key: &TaskKey, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET status = ?, attempts = 0, bytes_done = 0, last_error = ?, not_before = 0,
                  updated_at = datetime('now')
              WHERE item_id = ? AND file_name = ?",
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(reason)
        .bind(&key.item_id)
        .bind(&key.file_name)
        .execute(self.db.pool())
        .await?;
        check_affected(key, result.rows_affected())
    }

    /// Records partial progress for a running transfer.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::TaskNotFound`] if no task has the key.
    pub async fn update_progress(
        &self,
        key: &TaskKey,
        bytes_done: u64,
        size_bytes: Option<u64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET bytes_done = ?, size_bytes = COALESCE(?, size_bytes), updated_at = datetime('now')
              WHERE item_id = ? AND file_name = ?",
        )
        .bind(to_i64(bytes_done))
        .bind(size_bytes.map(to_i64))
        .bind(&key.item_id)
        .bind(&key.file_name)
        .execute(self.db.pool())
        .await?;
        check_affected(key, result.rows_affected())
    }

    /// Resets all in-progress tasks back to pending.
    ///
    /// Called at startup for crash recovery: anything left `in_progress`
    /// by a previous process is returned to the queue. The interrupted claim
    /// is not counted against the retry ceiling.
    ///
    /// # Returns
    ///
    /// The number of tasks that were reset.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_in_progress(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET status = ?, attempts = MAX(attempts - 1, 0), not_before = 0,
                  updated_at = datetime('now')
              WHERE status = ?",
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(TaskStatus::InProgress.as_str())
        .execute(self.db.pool())
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            info!(reset, "recovered interrupted tasks");
        }
        Ok(reset)
    }

    /// Returns failed tasks to pending with a fresh attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn requeue_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE tasks
              SET status = ?, attempts = 0, not_before = 0, updated_at = datetime('now')
              WHERE status = ?",
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(TaskStatus::Failed.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Counts tasks per status.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query(r"SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
            .fetch_all(self.db.pool())
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let raw: String = row.get("status");
            let status = raw
                .parse::<TaskStatus>()
                .map_err(|reason| StateError::invalid_value("status", reason))?;
            counts.add(status, to_u64(row.get::<i64, _>("count")));
        }
        Ok(counts)
    }

    /// Sum of bytes recorded across all tasks.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    pub async fn total_bytes_done(&self) -> Result<u64> {
        let row = sqlx::query(r"SELECT COALESCE(SUM(bytes_done), 0) AS total FROM tasks")
            .fetch_one(self.db.pool())
            .await?;
        Ok(to_u64(row.get::<i64, _>("total")))
    }

    /// Persists job settings so later runs can resume with only the directory.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidValue`] if serialization fails, or
    /// [`StateError::Database`] if the write fails.
    pub async fn save_settings<T: Serialize + Sync>(&self, settings: &T) -> Result<()> {
        self.put_meta(SETTINGS_KEY, settings).await
    }

    /// Loads job settings saved by [`StateStore::save_settings`].
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidValue`] if the stored JSON does not decode.
    pub async fn load_settings<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.get_meta(SETTINGS_KEY).await
    }

    /// Records the latest aggregate throughput sample.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the write fails.
    pub async fn record_throughput(&self, bytes_per_sec: f64) -> Result<()> {
        let sample = ThroughputSample {
            bytes_per_sec,
            recorded_at_ms: now_millis(),
        };
        self.put_meta(THROUGHPUT_KEY, &sample).await
    }

    /// Reads the latest throughput sample.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidValue`] if the stored JSON does not decode.
    pub async fn last_throughput(&self) -> Result<Option<ThroughputSample>> {
        self.get_meta(THROUGHPUT_KEY).await
    }

    /// Deletes all tasks and job metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the transaction fails.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<u64> {
        let mut tx = self.db.pool().begin().await?;
        let removed = sqlx::query(r"DELETE FROM tasks").execute(&mut *tx).await?;
        sqlx::query(r"DELETE FROM job_meta").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(removed.rows_affected())
    }

    /// Closes the underlying pool.
    pub async fn close(self) {
        self.db.close().await;
    }

    async fn put_meta<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|err| StateError::invalid_value(key, err.to_string()))?;
        sqlx::query(
            r"INSERT INTO job_meta (key, value) VALUES (?, ?)
              ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(json)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn get_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let row = sqlx::query(r"SELECT value FROM job_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.get("value");
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| StateError::invalid_value(key, err.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_task(item: &str, name: &str, size: Option<u64>) -> NewTask {
        NewTask {
            key: TaskKey::new(item, name),
            target_path: PathBuf::from(format!("/out/{item}/{name}")),
            size_bytes: size,
        }
    }

    #[test]
    fn test_state_db_path_layout() {
        assert_eq!(
            state_db_path(Path::new("/mirror")),
            Path::new("/mirror/.grabia/state.db")
        );
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_keeps_status() {
        let store = StateStore::in_memory().await.unwrap();
        let task = new_task("item", "a.mp3", Some(10));

        store.register(&task).await.unwrap();
        store.mark_completed(&task.key, 10).await.unwrap();
        let again = store.register(&task).await.unwrap();

        assert_eq!(again.status(), TaskStatus::Completed);
        assert_eq!(store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_refreshes_declared_size() {
        let store = StateStore::in_memory().await.unwrap();
        store.register(&new_task("item", "a", Some(10))).await.unwrap();
        let updated = store.register(&new_task("item", "a", Some(12))).await.unwrap();
        assert_eq!(updated.size_bytes, Some(12));

        let unknown = store.register(&new_task("item", "a", None)).await.unwrap();
        assert_eq!(unknown.size_bytes, Some(12), "unknown size keeps the last known");
    }

    #[tokio::test]
    async fn test_claim_next_follows_registration_order() {
        let store = StateStore::in_memory().await.unwrap();
        store.register(&new_task("item", "b", None)).await.unwrap();
        store.register(&new_task("item", "a", None)).await.unwrap();

        let first = store.claim_next(now_millis()).await.unwrap().unwrap();
        let second = store.claim_next(now_millis()).await.unwrap().unwrap();
        assert_eq!(first.file_name, "b");
        assert_eq!(second.file_name, "a");
        assert_eq!(first.status(), TaskStatus::InProgress);
        assert_eq!(first.attempts, 1);
        assert!(store.claim_next(now_millis()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_next_honours_not_before() {
        let store = StateStore::in_memory().await.unwrap();
        let task = new_task("item", "a", None);
        store.register(&task).await.unwrap();
        store.claim_next(0).await.unwrap().unwrap();
        store.requeue(&task.key, Some("timeout"), 5_000, false).await.unwrap();

        assert!(store.claim_next(4_999).await.unwrap().is_none());
        assert_eq!(store.next_ready_at().await.unwrap(), Some(5_000));
        let claimed = store.claim_next(5_000).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 2);
        assert_eq!(claimed.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_requeue_with_refund_keeps_attempt_budget() {
        let store = StateStore::in_memory().await.unwrap();
        let task = new_task("item", "a", None);
        store.register(&task).await.unwrap();
        store.claim_next(0).await.unwrap().unwrap();
        store.requeue(&task.key, None, 0, true).await.unwrap();

        let stored = store.get(&task.key).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_reset_in_progress_returns_claimed_tasks() {
        let store = StateStore::in_memory().await.unwrap();
        store.register(&new_task("item", "a", None)).await.unwrap();
        store.register(&new_task("item", "b", None)).await.unwrap();
        store.claim_next(0).await.unwrap();

        assert_eq!(store.reset_in_progress().await.unwrap(), 1);
        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.in_progress, 0);
    }

    #[tokio::test]
    async fn test_requeue_failed_resets_attempts() {
        let store = StateStore::in_memory().await.unwrap();
        let task = new_task("item", "a", None);
        store.register(&task).await.unwrap();
        store.claim_next(0).await.unwrap();
        store.mark_failed(&task.key, "HTTP 404").await.unwrap();

        assert_eq!(store.requeue_failed().await.unwrap(), 1);
        let stored = store.get(&task.key).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::Pending);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn test_query_filters_by_item() {
        let store = StateStore::in_memory().await.unwrap();
        store.register(&new_task("one", "a", None)).await.unwrap();
        store.register(&new_task("two", "a", None)).await.unwrap();
        store.register(&new_task("one", "b", None)).await.unwrap();

        let names: Vec<_> = store
            .query("one")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.file_name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_whole_task() {
        let store = StateStore::in_memory().await.unwrap();
        let registered = store.register(&new_task("item", "a", Some(4))).await.unwrap();

        let mut edited = registered.clone();
        edited.status_str = TaskStatus::Skipped.as_str().to_string();
        edited.bytes_done = 4;
        store.upsert(&edited).await.unwrap();

        let state = store.load().await.unwrap();
        let stored = &state[&TaskKey::new("item", "a")];
        assert_eq!(stored.status(), TaskStatus::Skipped);
        assert_eq!(stored.bytes_done, 4);
    }

    #[tokio::test]
    async fn test_mark_on_missing_key_is_not_found() {
        let store = StateStore::in_memory().await.unwrap();
        let result = store.mark_completed(&TaskKey::new("ghost", "x"), 1).await;
        assert!(matches!(result, Err(StateError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_settings_and_throughput_round_trip() {
        let store = StateStore::in_memory().await.unwrap();
        assert!(store.load_settings::<Vec<String>>().await.unwrap().is_none());

        store
            .save_settings(&vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        store.record_throughput(1024.0).await.unwrap();

        let settings: Vec<String> = store.load_settings().await.unwrap().unwrap();
        assert_eq!(settings, vec!["a", "b"]);
        let sample = store.last_throughput().await.unwrap().unwrap();
        assert!((sample.bytes_per_sec - 1024.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_clear_removes_tasks_and_meta() {
        let store = StateStore::in_memory().await.unwrap();
        store.register(&new_task("item", "a", None)).await.unwrap();
        store.save_settings(&1_u32).await.unwrap();

        assert_eq!(store.clear().await.unwrap(), 1);
        assert!(store.all().await.unwrap().is_empty());
        assert!(store.load_settings::<u32>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_creates_state_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StateStore::open_existing(dir.path()).await.unwrap().is_none());

        let store = StateStore::open(dir.path()).await.unwrap();
        store.register(&new_task("item", "a", None)).await.unwrap();
        store.close().await;

        assert!(state_db_path(dir.path()).is_file());
        let reopened = StateStore::open_existing(dir.path()).await.unwrap().unwrap();
        assert_eq!(reopened.all().await.unwrap().len(), 1);
    }
}
