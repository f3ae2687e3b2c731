//! Constants for the download module (timeouts, chunking, scaling bounds).

use std::time::Duration;

/// Default HTTP connect timeout.
pub const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Default per-read idle timeout for response bodies.
pub const IDLE_TIMEOUT_SECS: u64 = 60;

/// Largest slice of budget a single `acquire` call may take at once.
pub const RATE_CHUNK_BYTES: u64 = 64 * 1024;

/// Bytes per "MB" in user-facing speed limits.
pub const BYTES_PER_MB: u64 = 1_048_576;

/// Hard ceiling on concurrent workers.
pub const MAX_WORKERS_CEILING: usize = 64;

/// Default worker ceiling when none is configured.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default interval between scaling decisions.
pub const DEFAULT_SCALING_INTERVAL: Duration = Duration::from_secs(5);

/// How often in-flight progress is written to the state store.
pub const PROGRESS_PERSIST_INTERVAL: Duration = Duration::from_secs(2);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Whole-request timeout for metadata fetches and HEAD size probes.
pub const METADATA_TIMEOUT_SECS: u64 = 15;
