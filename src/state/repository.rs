//! Repository seam for the task operations the worker pool depends on.
//!
//! The engine only claims, requeues and finalizes tasks. Keeping that surface
//! behind a trait lets the scheduler run against any store implementation.

use async_trait::async_trait;

use super::{DownloadTask, Result, StateStore, TaskKey};

/// Data-access contract used by the download engine.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Claims the next ready pending task.
    async fn claim_next(&self, now_ms: i64) -> Result<Option<DownloadTask>>;

    /// Earliest retry gate among pending tasks.
    async fn next_ready_at(&self) -> Result<Option<i64>>;

    /// Returns a claimed task to pending.
    async fn requeue(
        &self,
        key: &TaskKey,
        error: Option<&str>,
        not_before_ms: i64,
        refund_attempt: bool,
    ) -> Result<()>;

    /// Marks a task completed.
    async fn mark_completed(&self, key: &TaskKey, bytes: u64) -> Result<()>;

    /// Marks a task failed.
    async fn mark_failed(&self, key: &TaskKey, error: &str) -> Result<()>;

    /// Records partial progress.
    async fn update_progress(
        &self,
        key: &TaskKey,
        bytes_done: u64,
        size_bytes: Option<u64>,
    ) -> Result<()>;

    /// Records the latest aggregate throughput.
    async fn record_throughput(&self, bytes_per_sec: f64) -> Result<()>;
}

#[async_trait]
impl TaskRepository for StateStore {
    async fn claim_next(&self, now_ms: i64) -> Result<Option<DownloadTask>> {
        StateStore::claim_next(self, now_ms).await
    }

    async fn next_ready_at(&self) -> Result<Option<i64>> {
        StateStore::next_ready_at(self).await
    }

    async fn requeue(
        &self,
        key: &TaskKey,
        error: Option<&str>,
        not_before_ms: i64,
        refund_attempt: bool,
    ) -> Result<()> {
        StateStore::requeue(self, key, error, not_before_ms, refund_attempt).await
    }

    async fn mark_completed(&self, key: &TaskKey, bytes: u64) -> Result<()> {
        StateStore::mark_completed(self, key, bytes).await
    }

    async fn mark_failed(&self, key: &TaskKey, error: &str) -> Result<()> {
        StateStore::mark_failed(self, key, error).await
    }

    async fn update_progress(
        &self,
        key: &TaskKey,
        bytes_done: u64,
        size_bytes: Option<u64>,
    ) -> Result<()> {
        StateStore::update_progress(self, key, bytes_done, size_bytes).await
    }

    async fn record_throughput(&self, bytes_per_sec: f64) -> Result<()> {
        StateStore::record_throughput(self, bytes_per_sec).await
    }
}
