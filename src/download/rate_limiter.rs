//! Aggregate bandwidth limiting shared by all transfer workers.
//!
//! This module provides a token-bucket [`RateLimiter`]. The bucket refills
//! continuously at the configured rate and holds at most
//! `max(64 KiB, rate / 4)` bytes of burst. Callers ask for budget with
//! [`RateLimiter::acquire`]; large requests are split into chunks of at most
//! 64 KiB so one transfer cannot hold the bucket while others wait.
//!
//! The bucket sits behind a `tokio::sync::Mutex`, whose waiters are served in
//! FIFO order. A waiter that must sleep for a deficit keeps the lock while it
//! sleeps, so budget is handed out in request order.
//!
//! # Example
//!
//! ```
//! use grabia_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::from_mb_per_sec(2.0);
//! limiter.acquire(16 * 1024).await;
//!
//! let unlimited = RateLimiter::disabled();
//! unlimited.acquire(u64::MAX).await; // returns immediately
//! # }
//! ```

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{BYTES_PER_MB, MAX_RETRY_AFTER, RATE_CHUNK_BYTES};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl Bucket {
    #[allow(clippy::cast_precision_loss)]
    fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        let capacity = (rate / 4.0).max(RATE_CHUNK_BYTES as f64);
        Self {
            tokens: capacity,
            capacity,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Token-bucket limiter for aggregate download throughput.
///
/// Shared via `Arc` between all workers of a run. A limiter built with a rate
/// of zero is disabled: `acquire` returns immediately and takes no lock.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Mutex<Bucket>>,
    bytes_per_sec: u64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RateLimiter {
    /// Creates a limiter capped at `bytes_per_sec`; `0` disables limiting.
    #[must_use]
    pub fn new(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            return Self::disabled();
        }
        debug!(bytes_per_sec, "rate limiter enabled");
        Self {
            bucket: Some(Mutex::new(Bucket::new(bytes_per_sec))),
            bytes_per_sec,
        }
    }

    /// Creates a limiter from a user-facing MB/s value (1 MB = 1 048 576 bytes).
    ///
    /// Zero, negative and non-finite values disable limiting.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn from_mb_per_sec(mb_per_sec: f64) -> Self {
        if !mb_per_sec.is_finite() || mb_per_sec <= 0.0 {
            return Self::disabled();
        }
        let bytes = (mb_per_sec * BYTES_PER_MB as f64).round() as u64;
        Self::new(bytes.max(1))
    }

    /// Creates a limiter that never waits.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            bucket: None,
            bytes_per_sec: 0,
        }
    }

    /// Returns whether limiting is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Configured cap in bytes per second, `None` when disabled.
    #[must_use]
    pub fn bytes_per_sec(&self) -> Option<u64> {
        self.is_enabled().then_some(self.bytes_per_sec)
    }

    /// Waits until `n_bytes` of budget have been granted.
    ///
    /// Cancel-safe: dropping the future forfeits only the chunk being waited on.
    #[instrument(level = "trace", skip(self))]
    pub async fn acquire(&self, n_bytes: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        let mut remaining = n_bytes;
        while remaining > 0 {
            let chunk = remaining.min(RATE_CHUNK_BYTES);
            Self::acquire_chunk(bucket, chunk).await;
            remaining -= chunk;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    async fn acquire_chunk(bucket: &Mutex<Bucket>, chunk: u64) {
        let wanted = chunk as f64;
        let mut state = bucket.lock().await;
        state.refill(Instant::now());

        let deficit = wanted - state.tokens;
        if deficit > 0.0 {
            let wait = Duration::from_secs_f64(deficit / state.rate);
            tokio::time::sleep(wait).await;
            state.refill(Instant::now());
        }
        state.tokens -= wanted;
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both formats specified in RFC 7231:
/// - Integer seconds: `"120"` → 120 seconds
/// - HTTP-date: `"Wed, 21 Oct 2015 07:28:00 GMT"` → duration until that time
///
/// Returns `None` if the value cannot be parsed or is negative.
/// Caps the result at 1 hour to prevent excessive delays.
///
/// # Examples
///
/// ```
/// use grabia_core::download::parse_retry_after;
/// use std::time::Duration;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        return Some(cap_retry_after(Duration::from_secs(seconds)));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(cap_retry_after(duration)),
        Err(_) => {
            debug!(header_value, "Retry-After date is in the past");
            Some(Duration::ZERO)
        }
    }
}

fn cap_retry_after(duration: Duration) -> Duration {
    if duration > MAX_RETRY_AFTER {
        warn!(
            delay_secs = duration.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping at 1 hour"
        );
        return MAX_RETRY_AFTER;
    }
    duration
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_disabled_limiter_never_waits() {
        let limiter = RateLimiter::new(0);
        assert!(!limiter.is_enabled());
        let start = Instant::now();
        limiter.acquire(100 * 1024 * 1024).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_from_mb_per_sec_uses_binary_megabytes() {
        assert_eq!(RateLimiter::from_mb_per_sec(1.0).bytes_per_sec(), Some(1_048_576));
        assert_eq!(RateLimiter::from_mb_per_sec(0.5).bytes_per_sec(), Some(524_288));
        assert_eq!(RateLimiter::from_mb_per_sec(0.0).bytes_per_sec(), None);
        assert_eq!(RateLimiter::from_mb_per_sec(-3.0).bytes_per_sec(), None);
        assert_eq!(RateLimiter::from_mb_per_sec(f64::NAN).bytes_per_sec(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_capacity_is_immediate() {
        let limiter = RateLimiter::new(1_048_576);
        let start = Instant::now();
        limiter.acquire(256 * 1024).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_throughput_converges_to_cap() {
        let rate = 1_048_576_u64;
        let limiter = Arc::new(RateLimiter::new(rate));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                for _ in 0..8 {
                    limiter.acquire(64 * 1024).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 2 MiB total, 256 KiB of initial burst, 1 MiB/s refill.
        let elapsed = start.elapsed().as_secs_f64();
        assert!((1.7..=1.8).contains(&elapsed), "elapsed {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_transfers_share_budget_fairly() {
        let limiter = Arc::new(RateLimiter::new(64 * 1024));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                for _ in 0..8 {
                    limiter.acquire(64 * 1024).await;
                }
                start.elapsed().as_secs_f64()
            }));
        }
        let mut finished = Vec::new();
        for handle in handles {
            finished.push(handle.await.unwrap());
        }

        // 16 chunks at one chunk per second, the first from the initial burst.
        // Grants alternate, so the two transfers finish within two chunks.
        let last = finished.iter().copied().fold(0.0_f64, f64::max);
        let first = finished.iter().copied().fold(f64::MAX, f64::min);
        assert!((14.9..=15.1).contains(&last), "last finished at {last}");
        assert!(last - first <= 2.1, "unfair split: {finished:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_request_is_split_into_chunks() {
        let limiter = Arc::new(RateLimiter::new(64 * 1024));
        let big = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter.acquire(8 * 64 * 1024).await;
                Instant::now()
            })
        };
        tokio::task::yield_now().await;
        let small_done = {
            limiter.acquire(64 * 1024).await;
            Instant::now()
        };
        let big_done = big.await.unwrap();
        assert!(
            small_done < big_done,
            "a small request must not wait behind a whole large one"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_pends_until_budget_refills() {
        let limiter = RateLimiter::new(64 * 1024);
        limiter.acquire(64 * 1024).await;

        let mut next = tokio_test::task::spawn(limiter.acquire(64 * 1024));
        tokio_test::assert_pending!(next.poll());

        tokio::time::advance(Duration::from_millis(500)).await;
        tokio_test::assert_pending!(next.poll());

        tokio::time::advance(Duration::from_millis(500)).await;
        tokio_test::assert_ready!(next.poll());
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("  120  "), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("invalid"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let past_date = "Wed, 01 Jan 2020 00:00:00 GMT";
        assert_eq!(parse_retry_after(past_date), Some(Duration::ZERO));

        let future = std::time::SystemTime::now() + Duration::from_secs(60);
        let parsed = parse_retry_after(&httpdate::fmt_http_date(future)).unwrap();
        assert!(parsed <= Duration::from_secs(60));
        assert!(parsed >= Duration::from_secs(58));
    }
}
