//! HTTP transfer machinery: client, rate limiting, retries and the worker pool.
//!
//! Files are always streamed to `<target>.part` and renamed over the target
//! only after the byte count checks out, so a target path never holds a
//! partial file.

mod client;
pub mod constants;
mod engine;
mod error;
pub mod filename;
pub mod rate_limiter;
mod retry;

pub use client::{ClientBuildError, HttpClient, HttpOptions, content_length};
pub use engine::{
    DownloadEngine, DownloadStats, EngineConfig, EngineError, RunReport, ScalingConfig,
    ScalingController, ScalingDecision, ScalingSample,
};
pub use error::DownloadError;
pub use filename::{item_dir, item_relative_path, sanitize_filename, target_path};
pub use rate_limiter::{RateLimiter, parse_retry_after};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};

// Note: we do NOT define module-local Result aliases here.
// Use `Result<T, DownloadError>` explicitly in function signatures.
