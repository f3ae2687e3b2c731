//! Job orchestration: `start`, `resume`, `status` and `clean`.
//!
//! [`Mirror`] is the front door of the library. A job lives in one output
//! directory; its settings and task table are kept in the state store under
//! `<output_dir>/.grabia/`, so `resume` and `status` need nothing but the
//! directory.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use grabia_core::download::HttpClient;
//! use grabia_core::job::{JobOptions, Mirror};
//! use grabia_core::manifest::ArchiveEndpoints;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mirror = Mirror::new(HttpClient::new(), ArchiveEndpoints::default());
//! let options = JobOptions::new(vec!["gd1977-05-08".into()], PathBuf::from("./mirror"));
//! let summary = mirror.start(&options, CancellationToken::new()).await?;
//! println!("{} completed, {} failed", summary.counts.completed, summary.counts.failed);
//! # Ok(())
//! # }
//! ```

mod error;
mod prepare;

pub use error::JobError;
pub use prepare::{ALREADY_PRESENT_REASON, DESELECTED_REASON, PrepareCounts};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use self::prepare::Preparer;
use crate::download::constants::{DEFAULT_MAX_WORKERS, IDLE_TIMEOUT_SECS, MAX_WORKERS_CEILING};
use crate::download::{
    DownloadEngine, EngineConfig, HttpClient, RateLimiter, RetryPolicy, RunReport, ScalingConfig,
};
use crate::events::{EventBus, EventKind, ProgressEvent};
use crate::filter::{FilterConfig, FilterSpec, select};
use crate::manifest::{ArchiveEndpoints, ArchiveResolver, ManifestResolver};
use crate::readme::write_readme;
use crate::reconcile::{CleanOptions, ReconciliationReport, Reconciler, UnavailableItem};
use crate::state::{StateStore, StatusCounts, TaskRepository, now_millis};

/// A throughput sample older than this is reported as zero.
const THROUGHPUT_STALE_AFTER_MS: i64 = 30_000;

/// Parameters of `start`.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub items: Vec<String>,
    pub output_dir: PathBuf,
    pub filter: FilterSpec,
    pub max_workers: usize,
    /// Aggregate cap in MiB/s; `0` means unlimited.
    pub speed_limit_mb_s: f64,
    /// Skip files already present with the declared size.
    pub sync: bool,
    pub dynamic_scaling: bool,
    pub write_readme: bool,
    /// Discard any previous job state in `output_dir` first.
    pub fresh: bool,
}

impl JobOptions {
    /// Options with defaults for everything but the items and directory.
    #[must_use]
    pub fn new(items: Vec<String>, output_dir: PathBuf) -> Self {
        Self {
            items,
            output_dir,
            filter: FilterSpec {
                keep_readme: true,
                ..FilterSpec::default()
            },
            max_workers: DEFAULT_MAX_WORKERS,
            speed_limit_mb_s: 0.0,
            sync: false,
            dynamic_scaling: true,
            write_readme: false,
            fresh: false,
        }
    }

    fn settings(&self) -> JobSettings {
        JobSettings {
            items: self.items.clone(),
            filter: self.filter.clone(),
            max_workers: self.max_workers,
            speed_limit_mb_s: self.speed_limit_mb_s,
            sync: self.sync,
            dynamic_scaling: self.dynamic_scaling,
            write_readme: self.write_readme,
        }
    }
}

/// Settings persisted with a job so `resume` can repeat them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    pub items: Vec<String>,
    pub filter: FilterSpec,
    pub max_workers: usize,
    pub speed_limit_mb_s: f64,
    pub sync: bool,
    pub dynamic_scaling: bool,
    #[serde(default)]
    pub write_readme: bool,
}

impl JobSettings {
    /// Checks ranges and compiles the filter.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidConfig`] or [`JobError::Filter`].
    pub fn validate(&self) -> Result<FilterConfig, JobError> {
        if self.items.is_empty() {
            return Err(JobError::invalid("items", "at least one item is required"));
        }
        if !(1..=MAX_WORKERS_CEILING).contains(&self.max_workers) {
            return Err(JobError::invalid(
                "max_workers",
                format!("{} is not between 1 and {MAX_WORKERS_CEILING}", self.max_workers),
            ));
        }
        if !self.speed_limit_mb_s.is_finite() || self.speed_limit_mb_s < 0.0 {
            return Err(JobError::invalid(
                "speed_limit",
                format!("{} is not a non-negative number", self.speed_limit_mb_s),
            ));
        }
        Ok(FilterConfig::from_spec(&self.filter)?)
    }
}

/// Outcome of `start` or `resume`.
#[derive(Debug, Clone, Default)]
pub struct JobSummary {
    /// Task counts after the run.
    pub counts: StatusCounts,
    pub run: RunReport,
    pub prepared: PrepareCounts,
    pub unavailable_items: Vec<UnavailableItem>,
    /// The stop signal ended the run early.
    pub cancelled: bool,
}

impl JobSummary {
    /// True when every selected file is on disk and every item resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.counts.failed == 0
            && self.counts.pending == 0
            && self.counts.in_progress == 0
            && self.unavailable_items.is_empty()
            && !self.cancelled
            && !self.run.disk_full
    }
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub output_dir: PathBuf,
    pub items: Vec<String>,
    pub counts: StatusCounts,
    pub bytes_done: u64,
    /// Last aggregate rate of a running engine, zero when stale.
    pub throughput_bytes_per_sec: f64,
    pub throughput_recorded_at_ms: Option<i64>,
}

/// Library facade over resolver, filter, state store and engine.
pub struct Mirror {
    client: HttpClient,
    endpoints: ArchiveEndpoints,
    resolver: Arc<dyn ManifestResolver>,
    events: EventBus,
    retry_policy: RetryPolicy,
    idle_timeout: Duration,
    scaling_interval: Duration,
}

impl Mirror {
    /// Creates a facade talking to `endpoints` through `client`.
    #[must_use]
    pub fn new(client: HttpClient, endpoints: ArchiveEndpoints) -> Self {
        let resolver = Arc::new(ArchiveResolver::new(client.clone(), endpoints.clone()));
        Self {
            client,
            endpoints,
            resolver,
            events: EventBus::default(),
            retry_policy: RetryPolicy::default(),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
            scaling_interval: ScalingConfig::default().interval,
        }
    }

    /// Replaces the manifest resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ManifestResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn with_scaling_interval(mut self, interval: Duration) -> Self {
        self.scaling_interval = interval;
        self
    }

    /// The bus every operation publishes on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Shorthand for `events().subscribe()`.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Starts (or continues) a job in `options.output_dir`.
    ///
    /// Configuration is validated before any network or disk activity.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] for invalid options, state store failures and
    /// engine failures. File and item failures are reported in the summary.
    #[instrument(skip_all, fields(output_dir = %options.output_dir.display(), items = options.items.len()))]
    pub async fn start(
        &self,
        options: &JobOptions,
        cancel: CancellationToken,
    ) -> Result<JobSummary, JobError> {
        let settings = options.settings();
        let filter = settings.validate()?;

        let store = StateStore::open(&options.output_dir).await?;
        if options.fresh {
            let removed = store.clear().await?;
            info!(removed, "previous job state discarded");
        }
        store.save_settings(&settings).await?;

        self.run_job(store, &options.output_dir, &settings, &filter, cancel)
            .await
    }

    /// Continues the job stored in `output_dir` with its saved settings.
    ///
    /// `max_workers` overrides the saved ceiling when given.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NoJob`] when the directory holds no job, plus
    /// everything [`Mirror::start`] may return.
    #[instrument(skip(self, output_dir, cancel), fields(output_dir = %output_dir.display()))]
    pub async fn resume(
        &self,
        output_dir: &Path,
        max_workers: Option<usize>,
        cancel: CancellationToken,
    ) -> Result<JobSummary, JobError> {
        let no_job = || JobError::NoJob {
            dir: output_dir.to_path_buf(),
        };
        let store = StateStore::open_existing(output_dir)
            .await?
            .ok_or_else(no_job)?;
        let mut settings: JobSettings = store.load_settings().await?.ok_or_else(no_job)?;
        if let Some(max_workers) = max_workers {
            settings.max_workers = max_workers;
        }
        let filter = settings.validate()?;
        store.save_settings(&settings).await?;

        self.run_job(store, output_dir, &settings, &filter, cancel)
            .await
    }

    /// Reads progress of the job in `output_dir` without touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NoJob`] when the directory holds no job.
    pub async fn status(output_dir: &Path) -> Result<StatusReport, JobError> {
        let Some(store) = StateStore::open_existing(output_dir).await? else {
            return Err(JobError::NoJob {
                dir: output_dir.to_path_buf(),
            });
        };
        let settings: Option<JobSettings> = store.load_settings().await?;
        let counts = store.status_counts().await?;
        let bytes_done = store.total_bytes_done().await?;
        let sample = store.last_throughput().await?;
        store.close().await;

        let throughput_bytes_per_sec = sample
            .filter(|s| now_millis() - s.recorded_at_ms <= THROUGHPUT_STALE_AFTER_MS)
            .map_or(0.0, |s| s.bytes_per_sec);

        Ok(StatusReport {
            output_dir: output_dir.to_path_buf(),
            items: settings.map(|s| s.items).unwrap_or_default(),
            counts,
            bytes_done,
            throughput_bytes_per_sec,
            throughput_recorded_at_ms: sample.map(|s| s.recorded_at_ms),
        })
    }

    /// Reconciles local files against fresh manifests. Never opens the
    /// state store.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Reconcile`] for an invalid filter.
    pub async fn clean(&self, options: &CleanOptions) -> Result<ReconciliationReport, JobError> {
        let reconciler = Reconciler::new(Arc::clone(&self.resolver), self.events.clone());
        Ok(reconciler.clean(options).await?)
    }

    async fn run_job(
        &self,
        store: StateStore,
        output_dir: &Path,
        settings: &JobSettings,
        filter: &FilterConfig,
        cancel: CancellationToken,
    ) -> Result<JobSummary, JobError> {
        store.reset_in_progress().await?;
        let requeued = store.requeue_failed().await?;
        if requeued > 0 {
            info!(requeued, "failed tasks returned to the queue");
        }
        self.events.emit(
            ProgressEvent::job(EventKind::JobStarted)
                .with_message(format!("{} items", settings.items.len())),
        );

        let mut summary = JobSummary::default();
        let preparer = Preparer {
            store: &store,
            client: &self.client,
            endpoints: &self.endpoints,
            events: &self.events,
            output_dir,
            sync: settings.sync,
            cancel: &cancel,
        };
        summary.prepared.deselected += preparer.park_unlisted(&settings.items).await?;

        for item_id in &settings.items {
            if cancel.is_cancelled() {
                break;
            }
            let resolved = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                resolved = self.resolver.resolve(item_id) => resolved,
            };
            let files = match resolved {
                Ok(files) => files,
                Err(err) => {
                    warn!(item_id = %item_id, cause = err.cause(), "manifest unavailable");
                    self.events.emit(
                        ProgressEvent::item(EventKind::ManifestUnavailable, item_id)
                            .with_message(err.cause()),
                    );
                    summary.unavailable_items.push(UnavailableItem {
                        item_id: item_id.clone(),
                        cause: err.cause().to_string(),
                    });
                    continue;
                }
            };

            let selected = select(&files, filter);
            info!(
                item_id = %item_id,
                listed = files.len(),
                selected = selected.len(),
                "manifest resolved"
            );
            self.events.emit(
                ProgressEvent::item(EventKind::ManifestResolved, item_id).with_message(format!(
                    "{} of {} files selected",
                    selected.len(),
                    files.len()
                )),
            );

            let counts = preparer.prepare_item(item_id, &selected).await?;
            summary.prepared.registered += counts.registered;
            summary.prepared.synced += counts.synced;
            summary.prepared.requeued += counts.requeued;
            summary.prepared.deselected += counts.deselected;
            summary.prepared.collisions += counts.collisions;

            if settings.write_readme
                && let Err(e) = write_readme(output_dir, item_id, &selected).await
            {
                warn!(item_id = %item_id, error = %e, "failed to write README");
            }
        }

        let engine = DownloadEngine::new(
            EngineConfig {
                max_workers: settings.max_workers,
                scaling: ScalingConfig {
                    enabled: settings.dynamic_scaling,
                    interval: self.scaling_interval,
                    ..ScalingConfig::default()
                },
                retry_policy: self.retry_policy.clone(),
                idle_timeout: self.idle_timeout,
                ..EngineConfig::default()
            },
            self.client.clone(),
            self.endpoints.clone(),
            Arc::new(RateLimiter::from_mb_per_sec(settings.speed_limit_mb_s)),
            self.events.clone(),
        )?;

        let repo: Arc<dyn TaskRepository> = Arc::new(store.clone());
        summary.run = engine.run(repo, cancel.clone()).await?;
        summary.counts = store.status_counts().await?;
        summary.cancelled = cancel.is_cancelled();
        store.close().await;

        info!(
            completed = summary.counts.completed,
            failed = summary.counts.failed,
            skipped = summary.counts.skipped,
            pending = summary.counts.pending,
            unavailable = summary.unavailable_items.len(),
            "job finished"
        );
        self.events.emit(ProgressEvent::job(EventKind::JobFinished).with_message(format!(
            "{} completed, {} failed, {} skipped",
            summary.counts.completed, summary.counts.failed, summary.counts.skipped
        )));
        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn settings() -> JobSettings {
        JobOptions::new(vec!["item".to_string()], PathBuf::from("/tmp/x")).settings()
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_worker_counts() {
        for value in [0, 65] {
            let mut s = settings();
            s.max_workers = value;
            assert!(matches!(
                s.validate(),
                Err(JobError::InvalidConfig { field: "max_workers", .. })
            ));
        }
    }

    #[test]
    fn test_validate_rejects_negative_or_nan_speed() {
        for value in [-1.0, f64::NAN, f64::INFINITY] {
            let mut s = settings();
            s.speed_limit_mb_s = value;
            assert!(matches!(
                s.validate(),
                Err(JobError::InvalidConfig { field: "speed_limit", .. })
            ));
        }
    }

    #[test]
    fn test_validate_rejects_empty_items_and_bad_regex() {
        let mut s = settings();
        s.items.clear();
        assert!(matches!(s.validate(), Err(JobError::InvalidConfig { field: "items", .. })));

        let mut s = settings();
        s.filter.regex = Some("[".to_string());
        assert!(matches!(s.validate(), Err(JobError::Filter(_))));
    }

    #[test]
    fn test_settings_round_trip_through_json() {
        let s = settings();
        let json = serde_json::to_string(&s).unwrap();
        let back: JobSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_summary_completeness() {
        let mut summary = JobSummary::default();
        assert!(summary.is_complete());
        summary.counts.failed = 1;
        assert!(!summary.is_complete());
    }

    #[tokio::test]
    async fn test_status_without_job_is_no_job() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Mirror::status(dir.path()).await,
            Err(JobError::NoJob { .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_without_job_is_no_job() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Mirror::new(HttpClient::new(), ArchiveEndpoints::default());
        assert!(matches!(
            mirror.resume(dir.path(), None, CancellationToken::new()).await,
            Err(JobError::NoJob { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_options_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("never-created");
        let mirror = Mirror::new(HttpClient::new(), ArchiveEndpoints::default());
        let mut options = JobOptions::new(vec!["item".to_string()], out.clone());
        options.max_workers = 0;
        assert!(mirror.start(&options, CancellationToken::new()).await.is_err());
        assert!(!out.exists());
    }
}
