//! Worker pool that drains the state store's pending tasks.
//!
//! The [`DownloadEngine`] claims tasks one at a time through a
//! [`TaskRepository`] and runs each in its own tokio task. The number of
//! concurrent transfers follows the target of a [`ScalingController`]:
//! growing dispatches more work immediately, shrinking simply withholds
//! dispatch until enough in-flight transfers finish. No transfer is ever
//! interrupted to shrink.
//!
//! Failed attempts are not retried inline. The task goes back to pending
//! with a `not_before` gate so the worker slot is freed while the backoff
//! elapses.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use grabia_core::download::{DownloadEngine, EngineConfig, HttpClient, RateLimiter};
//! use grabia_core::events::EventBus;
//! use grabia_core::manifest::ArchiveEndpoints;
//! use grabia_core::state::StateStore;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(StateStore::in_memory().await?);
//! let engine = DownloadEngine::new(
//!     EngineConfig::default(),
//!     HttpClient::new(),
//!     ArchiveEndpoints::default(),
//!     Arc::new(RateLimiter::disabled()),
//!     EventBus::default(),
//! )?;
//! let report = engine.run(store, CancellationToken::new()).await?;
//! println!("completed {}, failed {}", report.completed, report.failed);
//! # Ok(())
//! # }
//! ```

mod scaling;
mod transfer;

pub use scaling::{ScalingConfig, ScalingController, ScalingDecision, ScalingSample};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use self::transfer::{TaskResult, TransferOutcome, WorkerContext, run_task};
use super::constants::{IDLE_TIMEOUT_SECS, MAX_WORKERS_CEILING, PROGRESS_PERSIST_INTERVAL};
use super::retry::RetryPolicy;
use super::{HttpClient, RateLimiter};
use crate::events::{EventBus, EventKind, ProgressEvent};
use crate::manifest::ArchiveEndpoints;
use crate::state::{StateError, TaskKey, TaskRepository, now_millis};

/// Minimum allowed worker ceiling.
const MIN_WORKERS: usize = 1;

/// Error type for download engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid worker ceiling.
    #[error("invalid worker count {value}: must be between {MIN_WORKERS} and {MAX_WORKERS_CEILING}")]
    InvalidWorkerCount {
        /// The invalid value that was provided.
        value: usize,
    },

    /// The state store failed in a way the run cannot survive.
    #[error("state store error: {0}")]
    Store(#[from] StateError),

    /// Two workers were handed the same task.
    #[error("task {0} claimed twice")]
    DuplicateClaim(String),
}

/// Counters for one engine run, updated by all workers.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    cancelled: AtomicUsize,
    bytes: AtomicU64,
}

impl DownloadStats {
    /// Creates a new stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of files that completed.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Returns the number of files that failed permanently.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Returns the number of attempts requeued for retry.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Returns the number of transfers stopped by cancellation.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the body bytes written during this run.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::SeqCst);
    }
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrent transfers (1..=64).
    pub max_workers: usize,
    pub scaling: ScalingConfig,
    pub retry_policy: RetryPolicy,
    /// A body read that yields nothing for this long fails the attempt.
    pub idle_timeout: Duration,
    /// How often in-flight byte counts reach the state store.
    pub persist_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: super::constants::DEFAULT_MAX_WORKERS,
            scaling: ScalingConfig::default(),
            retry_policy: RetryPolicy::default(),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
            persist_interval: PROGRESS_PERSIST_INTERVAL,
        }
    }
}

/// Summary of one [`DownloadEngine::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
    pub cancelled: usize,
    pub bytes: u64,
    /// Dispatch stopped because the disk filled up.
    pub disk_full: bool,
    /// Largest worker target reached.
    pub peak_workers: usize,
}

impl RunReport {
    fn from_stats(stats: &DownloadStats, disk_full: bool, peak_workers: usize) -> Self {
        Self {
            completed: stats.completed(),
            failed: stats.failed(),
            retried: stats.retried(),
            cancelled: stats.cancelled(),
            bytes: stats.bytes(),
            disk_full,
            peak_workers,
        }
    }
}

/// Throughput bookkeeping between scaling ticks.
struct Sampler {
    at: Instant,
    bytes: u64,
    completed: usize,
    failures: usize,
}

impl Sampler {
    fn new(stats: &DownloadStats) -> Self {
        Self {
            at: Instant::now(),
            bytes: stats.bytes(),
            completed: stats.completed(),
            failures: stats.failed() + stats.retried(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn sample(&mut self, stats: &DownloadStats, active: usize) -> ScalingSample {
        let next = Self::new(stats);
        let secs = next.at.duration_since(self.at).as_secs_f64().max(f64::EPSILON);
        let sample = ScalingSample {
            bytes_per_sec: (next.bytes - self.bytes) as f64 / secs,
            completions: (next.completed - self.completed) as u64,
            failures: (next.failures - self.failures) as u64,
            active,
        };
        *self = next;
        sample
    }
}

/// Dynamic worker pool over a [`TaskRepository`].
#[derive(Debug)]
pub struct DownloadEngine {
    config: EngineConfig,
    client: HttpClient,
    endpoints: ArchiveEndpoints,
    limiter: Arc<RateLimiter>,
    events: EventBus,
}

impl DownloadEngine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidWorkerCount`] if `max_workers` is
    /// outside 1..=64.
    pub fn new(
        config: EngineConfig,
        client: HttpClient,
        endpoints: ArchiveEndpoints,
        limiter: Arc<RateLimiter>,
        events: EventBus,
    ) -> Result<Self, EngineError> {
        if !(MIN_WORKERS..=MAX_WORKERS_CEILING).contains(&config.max_workers) {
            return Err(EngineError::InvalidWorkerCount {
                value: config.max_workers,
            });
        }
        Ok(Self {
            config,
            client,
            endpoints,
            limiter,
            events,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Drains the repository until no pending task remains, the token is
    /// cancelled, or the disk fills up.
    ///
    /// On cancellation every in-flight transfer stops at its next chunk
    /// boundary and its task returns to pending with the `.part` file kept.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when claiming fails or the store
    /// reports corruption. Per-file failures are not errors; they are
    /// counted in the report.
    #[instrument(skip_all, fields(max_workers = self.config.max_workers))]
    pub async fn run(
        &self,
        repo: Arc<dyn TaskRepository>,
        cancel: CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let stats = Arc::new(DownloadStats::new());
        let workers_cancel = cancel.child_token();
        let ctx = Arc::new(WorkerContext {
            client: self.client.clone(),
            endpoints: self.endpoints.clone(),
            limiter: Arc::clone(&self.limiter),
            repo: Arc::clone(&repo),
            events: self.events.clone(),
            policy: self.config.retry_policy.clone(),
            idle_timeout: self.config.idle_timeout,
            persist_interval: self.config.persist_interval,
            stats: Arc::clone(&stats),
            cancel: workers_cancel.clone(),
        });

        let mut controller = ScalingController::new(self.config.max_workers, self.config.scaling);
        let mut target = controller.target();
        let mut peak = target;
        let in_flight: DashMap<TaskKey, ()> = DashMap::new();
        let mut workers: JoinSet<TaskResult> = JoinSet::new();
        let mut sampler = Sampler::new(&stats);
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.scaling.interval,
            self.config.scaling.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dispatch_open = true;
        let mut disk_full = false;
        let mut stop_logged = false;

        info!(initial_workers = target, "engine started");

        let fatal = loop {
            let stopping = cancel.is_cancelled() || !dispatch_open;
            if stopping && !stop_logged {
                stop_logged = true;
                info!(in_flight = workers.len(), "dispatch stopped, draining workers");
            }

            let mut next_ready = None;
            if !stopping {
                match self.fill(&repo, &ctx, &in_flight, &mut workers, target).await {
                    Ok(ready) => next_ready = ready,
                    Err(e) => break Some(e),
                }
            }

            if workers.is_empty() {
                let Some(ready_at) = next_ready.filter(|_| !stopping) else {
                    break None;
                };
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(until(ready_at)) => {}
                }
                continue;
            }

            let wake = next_ready.map(until);
            tokio::select! {
                joined = workers.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok(result) => {
                            in_flight.remove(&result.key);
                            match result.outcome {
                                TransferOutcome::Failed { disk_full: true } => {
                                    if dispatch_open {
                                        error!(key = %result.key, "disk full, halting dispatch");
                                        self.events.emit(ProgressEvent::file(
                                            EventKind::DiskFull,
                                            &result.key.item_id,
                                            &result.key.file_name,
                                        ));
                                    }
                                    dispatch_open = false;
                                    disk_full = true;
                                }
                                TransferOutcome::Fatal(e) => break Some(EngineError::Store(e)),
                                TransferOutcome::Completed
                                | TransferOutcome::Retrying
                                | TransferOutcome::Failed { .. }
                                | TransferOutcome::Cancelled => {}
                            }
                        }
                        Err(e) => error!(error = %e, "worker task panicked"),
                    }
                }
                _ = ticker.tick() => {
                    let sample = sampler.sample(&stats, workers.len());
                    if let Err(e) = repo.record_throughput(sample.bytes_per_sec).await {
                        warn!(error = %e, "failed to record throughput");
                    }
                    match controller.observe(sample) {
                        ScalingDecision::Grow(n) | ScalingDecision::Shrink(n) => {
                            info!(from = target, to = n, bytes_per_sec = sample.bytes_per_sec, "workers scaled");
                            target = n;
                            peak = peak.max(n);
                            self.events.emit(
                                ProgressEvent::job(EventKind::WorkersScaled)
                                    .with_message(format!("{n} workers")),
                            );
                        }
                        ScalingDecision::Hold => {}
                    }
                }
                () = sleep_opt(wake), if wake.is_some() && !stopping => {}
                () = cancel.cancelled(), if !stop_logged => {}
            }
        };

        if let Some(e) = fatal {
            error!(error = %e, "engine stopping on fatal error");
            workers_cancel.cancel();
            while workers.join_next().await.is_some() {}
            return Err(e);
        }

        let report = RunReport::from_stats(&stats, disk_full, peak);
        info!(
            completed = report.completed,
            failed = report.failed,
            retried = report.retried,
            cancelled = report.cancelled,
            bytes = report.bytes,
            "engine finished"
        );
        Ok(report)
    }

    /// Claims and spawns until `target` workers run or nothing is ready.
    ///
    /// Returns the earliest retry gate when the pool is below target
    /// because every pending task is still gated.
    async fn fill(
        &self,
        repo: &Arc<dyn TaskRepository>,
        ctx: &Arc<WorkerContext>,
        in_flight: &DashMap<TaskKey, ()>,
        workers: &mut JoinSet<TaskResult>,
        target: usize,
    ) -> Result<Option<i64>, EngineError> {
        while workers.len() < target {
            let Some(task) = repo.claim_next(now_millis()).await? else {
                return Ok(repo.next_ready_at().await?);
            };
            let key = task.key();
            if in_flight.insert(key.clone(), ()).is_some() {
                return Err(EngineError::DuplicateClaim(key.to_string()));
            }
            debug!(%key, attempt = task.attempts, "dispatching");
            workers.spawn(run_task(Arc::clone(ctx), task));
        }
        Ok(None)
    }
}

/// Time left until a `not_before` gate in unix milliseconds.
fn until(ready_at_ms: i64) -> Duration {
    let delta = ready_at_ms.saturating_sub(now_millis()).max(0);
    Duration::from_millis(u64::try_from(delta).unwrap_or(0))
}

async fn sleep_opt(wait: Option<Duration>) {
    if let Some(wait) = wait {
        tokio::time::sleep(wait).await;
    }
}
