//! Brings the state store in line with a fresh selection before dispatch.
//!
//! Every selected file gets a task. Existing tasks are checked against the
//! disk: a `Completed` task whose file vanished or changed size goes back to
//! `Pending`. In sync mode a pending file already present with the declared
//! size is marked `Skipped` without a transfer. Tasks the selection no
//! longer covers are parked as `Skipped`. When two manifest names sanitize
//! to the same local path, only the first listed gets a task.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::download::{HttpClient, target_path};
use crate::events::{EventBus, EventKind, ProgressEvent};
use crate::manifest::{ArchiveEndpoints, RemoteFile};
use crate::state::{DownloadTask, NewTask, StateError, StateStore, TaskKey, TaskStatus};

/// `last_error` marker of tasks parked because the filter dropped them.
pub const DESELECTED_REASON: &str = "no longer selected";

/// `last_error` marker of tasks satisfied by a file already on disk.
pub const ALREADY_PRESENT_REASON: &str = "already present";

/// What preparation did for one item.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrepareCounts {
    pub registered: usize,
    pub synced: usize,
    pub requeued: usize,
    pub deselected: usize,
    /// Files skipped because another name sanitizes to the same path.
    pub collisions: usize,
}

pub(super) struct Preparer<'a> {
    pub store: &'a StateStore,
    pub client: &'a HttpClient,
    pub endpoints: &'a ArchiveEndpoints,
    pub events: &'a EventBus,
    pub output_dir: &'a Path,
    pub sync: bool,
    pub cancel: &'a CancellationToken,
}

impl Preparer<'_> {
    #[instrument(skip(self, selected), fields(selected = selected.len()))]
    pub async fn prepare_item(
        &self,
        item_id: &str,
        selected: &[RemoteFile],
    ) -> Result<PrepareCounts, StateError> {
        let mut counts = PrepareCounts::default();
        let existing: HashMap<String, DownloadTask> = self
            .store
            .query(item_id)
            .await?
            .into_iter()
            .map(|task| (task.file_name.clone(), task))
            .collect();

        let mut selected_names = HashSet::with_capacity(selected.len());
        let mut targets: HashMap<PathBuf, &str> = HashMap::with_capacity(selected.len());
        for file in selected {
            let target = target_path(self.output_dir, item_id, &file.name);
            if let Some(first) = targets.get(&target) {
                warn!(
                    item_id,
                    file_name = %file.name,
                    kept = %first,
                    path = %target.display(),
                    "file maps to the same local path as another, skipping"
                );
                counts.collisions += 1;
                continue;
            }
            targets.insert(target.clone(), file.name.as_str());
            selected_names.insert(file.name.as_str());
            let task = self
                .store
                .register(&NewTask {
                    key: TaskKey::new(item_id, &file.name),
                    target_path: target,
                    size_bytes: file.size_bytes,
                })
                .await?;
            if !existing.contains_key(&file.name) {
                counts.registered += 1;
            }
            self.settle(task, &mut counts).await?;
        }

        for (name, task) in &existing {
            if selected_names.contains(name.as_str()) || task.status() != TaskStatus::Pending {
                continue;
            }
            let bytes_done = u64::try_from(task.bytes_done).unwrap_or(0);
            self.store
                .mark_skipped(&task.key(), bytes_done, DESELECTED_REASON)
                .await?;
            counts.deselected += 1;
        }
        if counts.deselected > 0 {
            info!(item_id, deselected = counts.deselected, "parked tasks no longer selected");
        }
        Ok(counts)
    }

    /// Parks pending tasks of items missing from `items`.
    ///
    /// Listed items whose manifest is unavailable keep their tasks.
    pub async fn park_unlisted(&self, items: &[String]) -> Result<usize, StateError> {
        let listed: HashSet<&str> = items.iter().map(String::as_str).collect();
        let mut parked = 0;
        for task in self.store.all().await? {
            if listed.contains(task.item_id.as_str()) || task.status() != TaskStatus::Pending {
                continue;
            }
            let bytes_done = u64::try_from(task.bytes_done).unwrap_or(0);
            self.store
                .mark_skipped(&task.key(), bytes_done, DESELECTED_REASON)
                .await?;
            parked += 1;
        }
        if parked > 0 {
            info!(parked, "parked tasks of items no longer listed");
        }
        Ok(parked)
    }

    /// Reconciles one registered task with the disk.
    async fn settle(
        &self,
        task: DownloadTask,
        counts: &mut PrepareCounts,
    ) -> Result<(), StateError> {
        let key = task.key();
        let local = local_len(&task.target_path()).await;
        let recorded = u64::try_from(task.bytes_done).unwrap_or(0);

        match task.status() {
            TaskStatus::Completed => {
                if local == Some(recorded) && task.expected_size().is_none_or(|s| s == recorded) {
                    return Ok(());
                }
                debug!(%key, ?local, recorded, "completed file missing or changed");
                self.store
                    .reset_to_pending(&key, "file missing or changed on disk")
                    .await?;
                counts.requeued += 1;
            }
            TaskStatus::Skipped => {
                let deselected = task.last_error.as_deref() == Some(DESELECTED_REASON);
                if !deselected
                    && local == Some(recorded)
                    && task.expected_size().is_none_or(|s| s == recorded)
                {
                    return Ok(());
                }
                let reason = if deselected {
                    "selected again"
                } else {
                    "file missing or changed on disk"
                };
                self.store.reset_to_pending(&key, reason).await?;
                counts.requeued += 1;
            }
            TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Failed => {}
        }

        if self.sync
            && let Some(local) = local
            && self.matches_remote(&task, local).await
        {
            self.store
                .mark_skipped(&key, local, ALREADY_PRESENT_REASON)
                .await?;
            counts.synced += 1;
            self.events.emit(
                ProgressEvent::file(EventKind::FileSkipped, &key.item_id, &key.file_name)
                    .with_bytes(local, Some(local))
                    .with_message(ALREADY_PRESENT_REASON),
            );
        }
        Ok(())
    }

    /// Compares a local length with the declared size, asking the server
    /// with a HEAD request when the manifest has no size.
    async fn matches_remote(&self, task: &DownloadTask, local: u64) -> bool {
        if let Some(expected) = task.expected_size() {
            return expected == local;
        }
        let url = self.endpoints.download_url(&task.item_id, &task.file_name);
        let probed = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return false,
            probed = self.client.probe_size(&url) => probed,
        };
        match probed {
            Ok(Some(remote)) => remote == local,
            Ok(None) => false,
            Err(err) => {
                debug!(%url, error = %err, "size probe failed, file will be downloaded");
                false
            }
        }
    }
}

async fn local_len(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}
