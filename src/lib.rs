//! grabia core library
//!
//! Mirrors filtered file sets of archive.org items into a local directory
//! with resumable, rate-limited, concurrent downloads, and reconciles the
//! local tree against the remote manifests.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`manifest`] - Per-item file listings from the metadata API
//! - [`filter`] - Reduction of a listing to the selected set
//! - [`state`] - Durable, resumable task state (`SQLite`)
//! - [`download`] - HTTP client, rate limiter, retries and the worker pool
//! - [`reconcile`] - Orphan and missing file detection (`clean`)
//! - [`job`] - The `start` / `resume` / `status` / `clean` facade
//! - [`events`] - Progress notifications for front ends
//! - [`input`] - Item list loading

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod db;
pub mod download;
pub mod events;
pub mod filter;
pub mod input;
pub mod job;
pub mod manifest;
pub mod readme;
pub mod reconcile;
pub mod state;
mod user_agent;

// Re-export commonly used types
pub use db::Database;
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadEngine, DownloadError, DownloadStats, EngineConfig, EngineError,
    FailureType, HttpClient, HttpOptions, RateLimiter, RetryDecision, RetryPolicy, RunReport,
    ScalingConfig, classify_error,
};
pub use events::{EventBus, EventKind, ProgressEvent};
pub use filter::{FilterConfig, FilterError, FilterSpec, select};
pub use input::{InputError, load_item_list};
pub use job::{JobError, JobOptions, JobSettings, JobSummary, Mirror, StatusReport};
pub use manifest::{ArchiveEndpoints, ArchiveResolver, ManifestError, ManifestResolver, RemoteFile};
pub use reconcile::{CleanOptions, ReconcileError, Reconciler, ReconciliationReport};
pub use state::{DownloadTask, StateError, StateStore, StatusCounts, TaskKey, TaskStatus};
