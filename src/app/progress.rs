//! Progress UI for download runs, fed by the library's event bus.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::time::Duration;

use grabia_core::{EventBus, EventKind, ProgressEvent};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Whether a progress bar should be drawn at all.
pub(crate) fn should_use_progress(
    stderr_is_terminal: bool,
    quiet: bool,
    dumb_terminal: bool,
) -> bool {
    stderr_is_terminal && !quiet && !dumb_terminal
}

pub(crate) fn stderr_is_terminal() -> bool {
    std::io::stderr().is_terminal()
}

pub(crate) fn is_dumb_terminal() -> bool {
    std::env::var("TERM")
        .map(|value| value.eq_ignore_ascii_case("dumb"))
        .unwrap_or(false)
}

/// Running tallies derived from the event stream.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub retried: usize,
    /// Bytes of files finished this run.
    pub finished_bytes: u64,
    /// In-flight files and their current byte counts.
    active: HashMap<(String, String), u64>,
    workers: Option<String>,
}

impl Tally {
    pub fn apply(&mut self, event: &ProgressEvent) {
        let key = || {
            (
                event.item_id.clone().unwrap_or_default(),
                event.file_name.clone().unwrap_or_default(),
            )
        };
        match event.kind {
            EventKind::FileStarted | EventKind::FileProgress => {
                self.active.insert(key(), event.bytes_done);
            }
            EventKind::FileCompleted => {
                self.active.remove(&key());
                self.completed += 1;
                self.finished_bytes += event.bytes_done;
            }
            EventKind::FileRetrying => {
                self.active.remove(&key());
                self.retried += 1;
            }
            EventKind::FileFailed => {
                self.active.remove(&key());
                self.failed += 1;
            }
            EventKind::FileCancelled => {
                self.active.remove(&key());
            }
            EventKind::FileSkipped => self.skipped += 1,
            EventKind::WorkersScaled => self.workers.clone_from(&event.message),
            _ => {}
        }
    }

    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// Finished plus in-flight bytes.
    pub fn bytes(&self) -> u64 {
        self.finished_bytes + self.active.values().sum::<u64>()
    }

    pub fn message(&self, elapsed: Duration) -> String {
        let secs = elapsed.as_secs_f64();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let rate = if secs > 0.0 {
            (self.bytes() as f64 / secs) as u64
        } else {
            0
        };
        let mut message = format!(
            "{} done, {} failed, {} skipped | {} active | {} ({}/s)",
            self.completed,
            self.failed,
            self.skipped,
            self.active(),
            HumanBytes(self.bytes()),
            HumanBytes(rate),
        );
        if self.retried > 0 {
            message.push_str(&format!(" | {} retries", self.retried));
        }
        if let Some(workers) = &self.workers {
            message.push_str(" | ");
            message.push_str(workers);
        }
        message
    }
}

/// Handle to a running progress bar task.
pub(crate) struct ProgressUi {
    handle: Option<JoinHandle<()>>,
    stop: CancellationToken,
}

impl ProgressUi {
    /// Subscribes to `events` and draws a bar until [`ProgressUi::finish`].
    /// When `enabled` is false nothing is spawned.
    pub fn spawn(enabled: bool, events: &EventBus) -> Self {
        let stop = CancellationToken::new();
        if !enabled {
            return Self { handle: None, stop };
        }
        let receiver = events.subscribe();
        let handle = tokio::spawn(render(receiver, stop.clone()));
        Self {
            handle: Some(handle),
            stop,
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stops the bar and waits for it to clear.
    pub async fn finish(self) {
        self.stop.cancel();
        if let Some(handle) = self.handle {
            let _ = handle.await;
        }
    }
}

async fn render(
    mut receiver: tokio::sync::broadcast::Receiver<ProgressEvent>,
    stop: CancellationToken,
) {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(100));

    let mut tally = Tally::default();
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            received = receiver.recv() => match received {
                Ok(event) => {
                    tally.apply(&event);
                    bar.set_message(tally.message(bar.elapsed()));
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
    bar.finish_and_clear();
}
