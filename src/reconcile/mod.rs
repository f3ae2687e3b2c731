//! Local-vs-manifest reconciliation (`clean`).
//!
//! For each listed item the [`Reconciler`] resolves a fresh manifest, applies
//! the filter pipeline and compares the selected names with the files found
//! under `<output_dir>/<item>/`:
//!
//! - `orphans = local - (selected + protected README)`
//! - `missing = selected - local`
//!
//! Orphans are deleted one by one unless the run is a dry run. A failed
//! deletion is recorded and the run moves on. Directories emptied by the
//! deletions are removed, the item directory itself is kept. An item whose
//! manifest is unavailable is skipped entirely.
//!
//! The reconciler never opens the state store.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::download::{item_dir, item_relative_path, sanitize_filename};
use crate::events::{EventBus, EventKind, ProgressEvent};
use crate::filter::{FilterConfig, FilterError, FilterSpec, README_FILE_NAME, select};
use crate::manifest::ManifestResolver;
use crate::state::STATE_DIR_NAME;

/// Reconciliation errors. Only configuration problems are fatal.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// A blocking filesystem scan panicked.
    #[error("filesystem scan aborted: {0}")]
    Scan(#[from] tokio::task::JoinError),
}

/// Inputs of one `clean` run.
#[derive(Debug, Clone)]
pub struct CleanOptions {
    pub items: Vec<String>,
    pub output_dir: PathBuf,
    pub filter: FilterSpec,
    /// Report only; delete nothing.
    pub dry_run: bool,
    /// Also treat item directories absent from `items` as orphans.
    pub prune_unlisted: bool,
}

/// A missing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingFile {
    pub item_id: String,
    pub file_name: String,
}

/// An orphan that could not be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteFailure {
    pub path: PathBuf,
    pub error: String,
}

/// An item skipped because its manifest could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnavailableItem {
    pub item_id: String,
    pub cause: String,
}

/// Outcome of a `clean` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub orphans: Vec<PathBuf>,
    pub missing: Vec<MissingFile>,
    /// Local files matching the selection (or protected).
    pub kept: usize,
    pub deleted: Vec<PathBuf>,
    pub delete_failures: Vec<DeleteFailure>,
    pub unavailable_items: Vec<UnavailableItem>,
    pub dry_run: bool,
}

impl ReconciliationReport {
    /// True when local state already matches every available item.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.missing.is_empty()
    }
}

/// Computes and applies orphan/missing differences.
pub struct Reconciler {
    resolver: Arc<dyn ManifestResolver>,
    events: EventBus,
}

impl Reconciler {
    #[must_use]
    pub fn new(resolver: Arc<dyn ManifestResolver>, events: EventBus) -> Self {
        Self { resolver, events }
    }

    /// Runs reconciliation for every listed item.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Filter`] for an invalid filter, before any
    /// network request is made.
    #[instrument(skip_all, fields(items = options.items.len(), dry_run = options.dry_run))]
    pub async fn clean(
        &self,
        options: &CleanOptions,
    ) -> Result<ReconciliationReport, ReconcileError> {
        let filter = FilterConfig::from_spec(&options.filter)?;
        let mut report = ReconciliationReport {
            dry_run: options.dry_run,
            ..ReconciliationReport::default()
        };

        for item_id in &options.items {
            let files = match self.resolver.resolve(item_id).await {
                Ok(files) => files,
                Err(err) => {
                    warn!(item_id = %item_id, cause = err.cause(), "manifest unavailable, item left untouched");
                    self.events.emit(
                        ProgressEvent::item(EventKind::ManifestUnavailable, item_id)
                            .with_message(err.cause()),
                    );
                    report.unavailable_items.push(UnavailableItem {
                        item_id: item_id.clone(),
                        cause: err.cause().to_string(),
                    });
                    continue;
                }
            };

            let selected = select(&files, &filter);
            let mut expected: BTreeSet<PathBuf> = BTreeSet::new();
            let mut names_by_path = Vec::with_capacity(selected.len());
            for file in &selected {
                let relative = item_relative_path(&file.name);
                expected.insert(relative.clone());
                names_by_path.push((relative, file.name.clone()));
            }
            if filter.keep_readme() {
                expected.insert(PathBuf::from(README_FILE_NAME));
            }

            let root = item_dir(&options.output_dir, item_id);
            let local = scan_files(root.clone()).await?;

            for (relative, name) in &names_by_path {
                if !local.contains(relative) {
                    self.events
                        .emit(ProgressEvent::file(EventKind::MissingFile, item_id, name));
                    report.missing.push(MissingFile {
                        item_id: item_id.clone(),
                        file_name: name.clone(),
                    });
                }
            }

            let mut item_orphans = Vec::new();
            for relative in &local {
                if expected.contains(relative) {
                    report.kept += 1;
                } else {
                    item_orphans.push(root.join(relative));
                }
            }
            debug!(
                item_id = %item_id,
                local = local.len(),
                orphans = item_orphans.len(),
                "item scanned"
            );

            for path in item_orphans {
                self.handle_orphan(&path, &root, options.dry_run, &mut report)
                    .await;
            }
        }

        if options.prune_unlisted {
            self.prune_unlisted(options, &mut report).await;
        }

        info!(
            orphans = report.orphans.len(),
            missing = report.missing.len(),
            deleted = report.deleted.len(),
            failures = report.delete_failures.len(),
            "clean finished"
        );
        Ok(report)
    }

    async fn handle_orphan(
        &self,
        path: &Path,
        stop_at: &Path,
        dry_run: bool,
        report: &mut ReconciliationReport,
    ) {
        let shown = path.display().to_string();
        self.events.emit(ProgressEvent::job(EventKind::OrphanFound).with_message(&shown));
        report.orphans.push(path.to_path_buf());
        if dry_run {
            return;
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %shown, "orphan deleted");
                self.events
                    .emit(ProgressEvent::job(EventKind::OrphanDeleted).with_message(&shown));
                report.deleted.push(path.to_path_buf());
                remove_empty_parents(path, stop_at).await;
            }
            Err(e) => {
                warn!(path = %shown, error = %e, "failed to delete orphan");
                self.events.emit(
                    ProgressEvent::job(EventKind::DeleteFailed)
                        .with_message(format!("{shown}: {e}")),
                );
                report.delete_failures.push(DeleteFailure {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Treats whole item directories that are not listed as orphans.
    async fn prune_unlisted(&self, options: &CleanOptions, report: &mut ReconciliationReport) {
        let listed: HashSet<String> = options
            .items
            .iter()
            .map(|id| sanitize_filename(id))
            .collect();

        let mut entries = match tokio::fs::read_dir(&options.output_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %options.output_dir.display(), error = %e, "cannot list output directory");
                return;
            }
        };

        let mut unlisted = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
                    if is_dir
                        && !name.starts_with('.')
                        && name != STATE_DIR_NAME
                        && !listed.contains(&name)
                    {
                        unlisted.push(entry.path());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "error while listing output directory");
                    break;
                }
            }
        }
        unlisted.sort();

        for dir in unlisted {
            let shown = dir.display().to_string();
            self.events
                .emit(ProgressEvent::job(EventKind::OrphanFound).with_message(&shown));
            report.orphans.push(dir.clone());
            if options.dry_run {
                continue;
            }
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    info!(dir = %shown, "unlisted item directory removed");
                    self.events
                        .emit(ProgressEvent::job(EventKind::OrphanDeleted).with_message(&shown));
                    report.deleted.push(dir);
                }
                Err(e) => {
                    warn!(dir = %shown, error = %e, "failed to remove unlisted item directory");
                    report.delete_failures.push(DeleteFailure {
                        path: dir,
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Relative paths of every regular file under `root`. A missing root is empty.
async fn scan_files(root: PathBuf) -> Result<BTreeSet<PathBuf>, tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || {
        let mut files = BTreeSet::new();
        if !root.is_dir() {
            return files;
        }
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&root) {
                files.insert(relative.to_path_buf());
            }
        }
        files
    })
    .await
}

/// Removes now-empty directories from `path`'s parent up to, not including, `stop_at`.
async fn remove_empty_parents(path: &Path, stop_at: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        // Fails on a non-empty directory, which ends the walk.
        if tokio::fs::remove_dir(dir).await.is_err() {
            break;
        }
        debug!(dir = %dir.display(), "removed empty directory");
        current = dir.parent();
    }
}
