//! One file transfer: `.part` staging, range resume, finalize, and the
//! state transition that follows.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::DownloadStats;
use crate::download::client::content_length;
use crate::download::rate_limiter::parse_retry_after;
use crate::download::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use crate::download::{DownloadError, HttpClient, RateLimiter};
use crate::events::{EventBus, EventKind, ProgressEvent};
use crate::manifest::ArchiveEndpoints;
use crate::state::{DownloadTask, StateError, TaskKey, TaskRepository, now_millis};

/// Minimum spacing of `FileProgress` events for one file.
const PROGRESS_EVENT_INTERVAL: Duration = Duration::from_millis(250);

/// Everything a worker needs, shared by all workers of a run.
pub(super) struct WorkerContext {
    pub client: HttpClient,
    pub endpoints: ArchiveEndpoints,
    pub limiter: Arc<RateLimiter>,
    pub repo: Arc<dyn TaskRepository>,
    pub events: EventBus,
    pub policy: RetryPolicy,
    pub idle_timeout: Duration,
    pub persist_interval: Duration,
    pub stats: Arc<DownloadStats>,
    pub cancel: CancellationToken,
}

/// How a worker left its task.
#[derive(Debug)]
pub(super) enum TransferOutcome {
    Completed,
    Retrying,
    Failed { disk_full: bool },
    Cancelled,
    /// The state store is unusable; the run must stop.
    Fatal(StateError),
}

/// Result handed back to the dispatcher.
#[derive(Debug)]
pub(super) struct TaskResult {
    pub key: TaskKey,
    pub outcome: TransferOutcome,
}

/// Runs one claimed task to a state transition.
#[instrument(skip_all, fields(key = %task.key(), attempt = task.attempts))]
pub(super) async fn run_task(ctx: Arc<WorkerContext>, task: DownloadTask) -> TaskResult {
    let key = task.key();
    let url = ctx.endpoints.download_url(&key.item_id, &key.file_name);
    let expected = task.expected_size();

    ctx.events.emit(
        ProgressEvent::file(EventKind::FileStarted, &key.item_id, &key.file_name)
            .with_bytes(u64::try_from(task.bytes_done).unwrap_or(0), expected),
    );

    let outcome = match transfer(&ctx, &task, &url).await {
        Ok(bytes) => finish_success(&ctx, &key, bytes, expected).await,
        Err(DownloadError::Cancelled { .. }) => finish_cancelled(&ctx, &key).await,
        Err(err) => finish_failure(&ctx, &task, &key, &err).await,
    };
    TaskResult { key, outcome }
}

/// Downloads into the `.part` file and renames it over the target.
async fn transfer(
    ctx: &WorkerContext,
    task: &DownloadTask,
    url: &str,
) -> Result<u64, DownloadError> {
    let target = task.target_path();
    let part = task.part_path();
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }

    let expected = task.expected_size();
    let written = fetch_to_part(ctx, task, url, &part, expected).await?;

    if let Some(expected) = expected
        && written != expected
    {
        if written > expected {
            // Overlong staging data can never become valid; start over.
            if let Err(e) = remove_part(&part).await {
                warn!(error = %e, "failed to discard overlong staging file");
            }
        }
        return Err(DownloadError::integrity(&target, expected, written));
    }

    fs::rename(&part, &target)
        .await
        .map_err(|e| DownloadError::io(&target, e))?;
    debug!(path = %target.display(), bytes = written, "file finalized");
    Ok(written)
}

/// Streams the body into `part`, resuming from its current length.
///
/// Returns the final length of the staging file.
async fn fetch_to_part(
    ctx: &WorkerContext,
    task: &DownloadTask,
    url: &str,
    part: &Path,
    expected: Option<u64>,
) -> Result<u64, DownloadError> {
    let mut offset = staged_len(part).await;
    if let Some(expected) = expected {
        if offset > expected {
            warn!(offset, expected, "staging file longer than declared size, discarding");
            remove_part(part).await?;
            offset = 0;
        } else if offset == expected && offset > 0 {
            debug!(offset, "staging file already complete");
            return Ok(offset);
        }
    }

    let response = match request(ctx, url, offset).await {
        Err(DownloadError::HttpStatus { status: 416, .. }) if offset > 0 => {
            debug!(offset, "range not satisfiable, restarting from zero");
            remove_part(part).await?;
            offset = 0;
            request(ctx, url, 0).await?
        }
        other => other?,
    };

    let resumed = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
    let declared = content_length(&response).map(|len| if resumed { offset + len } else { len });
    let total = expected.or(declared);

    let file = if resumed {
        info!(offset, "resuming transfer");
        OpenOptions::new()
            .append(true)
            .open(part)
            .await
            .map_err(|e| DownloadError::io(part, e))?
    } else {
        File::create(part)
            .await
            .map_err(|e| DownloadError::io(part, e))?
    };
    let start = if resumed { offset } else { 0 };

    let mut writer = BufWriter::new(file);
    let streamed = stream_body(ctx, task, url, part, response, &mut writer, start, total).await;
    let flushed = writer.flush().await.map_err(|e| DownloadError::io(part, e));
    let written = streamed?;
    flushed?;
    writer
        .get_ref()
        .sync_all()
        .await
        .map_err(|e| DownloadError::io(part, e))?;

    if expected.is_none()
        && let Some(declared) = declared
        && written != declared
    {
        return Err(DownloadError::integrity(part, declared, written));
    }
    Ok(written)
}

async fn request(
    ctx: &WorkerContext,
    url: &str,
    offset: u64,
) -> Result<reqwest::Response, DownloadError> {
    tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => Err(DownloadError::cancelled(url)),
        response = ctx.client.get_from(url, offset) => response,
    }
}

/// Copies the response body to `writer`, one rate-limited chunk at a time.
#[allow(clippy::too_many_arguments)]
async fn stream_body(
    ctx: &WorkerContext,
    task: &DownloadTask,
    url: &str,
    part: &Path,
    response: reqwest::Response,
    writer: &mut BufWriter<File>,
    start: u64,
    total: Option<u64>,
) -> Result<u64, DownloadError> {
    let key = task.key();
    let mut stream = response.bytes_stream();
    let mut written = start;
    let mut last_persist = Instant::now();
    let mut last_event = Instant::now();

    loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return Err(DownloadError::cancelled(url)),
            next = timeout(ctx.idle_timeout, stream.next()) => next,
        };
        let chunk = match next {
            Err(_) => return Err(DownloadError::stalled(url, ctx.idle_timeout.as_secs())),
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(DownloadError::network(url, e)),
            Ok(Some(Ok(chunk))) => chunk,
        };

        let len = chunk.len() as u64;
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return Err(DownloadError::cancelled(url)),
            () = ctx.limiter.acquire(len) => {}
        }

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(part, e))?;
        written += len;
        ctx.stats.add_bytes(len);

        if last_event.elapsed() >= PROGRESS_EVENT_INTERVAL {
            last_event = Instant::now();
            ctx.events.emit(
                ProgressEvent::file(EventKind::FileProgress, &key.item_id, &key.file_name)
                    .with_bytes(written, total),
            );
        }
        if last_persist.elapsed() >= ctx.persist_interval {
            last_persist = Instant::now();
            if let Err(e) = ctx.repo.update_progress(&key, written, total).await {
                warn!(error = %e, "failed to persist progress");
            }
        }
    }

    Ok(written)
}

async fn staged_len(part: &Path) -> u64 {
    fs::metadata(part).await.map(|m| m.len()).unwrap_or(0)
}

async fn remove_part(part: &Path) -> Result<(), DownloadError> {
    match fs::remove_file(part).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(PathBuf::from(part), e)),
    }
}

async fn finish_success(
    ctx: &WorkerContext,
    key: &TaskKey,
    bytes: u64,
    expected: Option<u64>,
) -> TransferOutcome {
    if let Err(e) = ctx.repo.mark_completed(key, bytes).await {
        let message = format!("downloaded but not recorded: {e}");
        if let Some(fatal) = store_failure(e, "mark completed") {
            return fatal;
        }
        // The task stays in progress and is recovered on the next run.
        ctx.stats.increment_failed();
        ctx.events.emit(
            ProgressEvent::file(EventKind::FileFailed, &key.item_id, &key.file_name)
                .with_message(message),
        );
        return TransferOutcome::Failed { disk_full: false };
    }
    ctx.stats.increment_completed();
    info!(bytes, "file completed");
    ctx.events.emit(
        ProgressEvent::file(EventKind::FileCompleted, &key.item_id, &key.file_name)
            .with_bytes(bytes, expected.or(Some(bytes))),
    );
    TransferOutcome::Completed
}

async fn finish_cancelled(ctx: &WorkerContext, key: &TaskKey) -> TransferOutcome {
    if let Err(e) = ctx.repo.requeue(key, None, 0, true).await
        && let Some(fatal) = store_failure(e, "requeue cancelled task")
    {
        return fatal;
    }
    ctx.stats.increment_cancelled();
    debug!("transfer cancelled, staging file kept");
    ctx.events.emit(ProgressEvent::file(
        EventKind::FileCancelled,
        &key.item_id,
        &key.file_name,
    ));
    TransferOutcome::Cancelled
}

async fn finish_failure(
    ctx: &WorkerContext,
    task: &DownloadTask,
    key: &TaskKey,
    err: &DownloadError,
) -> TransferOutcome {
    let failure = classify_error(err);
    let attempt = u32::try_from(task.attempts).unwrap_or(u32::MAX).max(1);
    let message = err.to_string();

    match ctx.policy.should_retry(failure, attempt) {
        RetryDecision::Retry { delay, .. } => {
            let delay = retry_after(err, failure).unwrap_or(delay);
            let not_before = now_millis() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
            if let Err(e) = ctx
                .repo
                .requeue(key, Some(&message), not_before, false)
                .await
                && let Some(fatal) = store_failure(e, "requeue for retry")
            {
                return fatal;
            }
            ctx.stats.increment_retried();
            warn!(error = %message, delay_ms = delay.as_millis(), "transfer failed, will retry");
            ctx.events.emit(
                ProgressEvent::file(EventKind::FileRetrying, &key.item_id, &key.file_name)
                    .with_message(message),
            );
            TransferOutcome::Retrying
        }
        RetryDecision::DoNotRetry { reason } => {
            if let Err(e) = ctx.repo.mark_failed(key, &message).await
                && let Some(fatal) = store_failure(e, "mark failed")
            {
                return fatal;
            }
            ctx.stats.increment_failed();
            warn!(error = %message, %reason, "transfer failed");
            ctx.events.emit(
                ProgressEvent::file(EventKind::FileFailed, &key.item_id, &key.file_name)
                    .with_message(message),
            );
            TransferOutcome::Failed {
                disk_full: err.is_disk_full(),
            }
        }
    }
}

/// Server-mandated delay, honoured for rate limiting and 503s.
fn retry_after(err: &DownloadError, failure: FailureType) -> Option<Duration> {
    let DownloadError::HttpStatus {
        retry_after: Some(header),
        ..
    } = err
    else {
        return None;
    };
    if !failure.is_retryable() {
        return None;
    }
    let delay = parse_retry_after(header)?;
    debug!(retry_after = %header, delay_ms = delay.as_millis(), "using Retry-After delay");
    Some(delay)
}

/// Store failures after a transfer are logged; corruption ends the run.
fn store_failure(error: StateError, action: &str) -> Option<TransferOutcome> {
    if error.is_corruption() {
        return Some(TransferOutcome::Fatal(error));
    }
    warn!(error = %error, action, "state update failed");
    None
}
