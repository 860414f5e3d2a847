//! Retry policy with capped linear backoff.
//!
//! When a transfer fails the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - network blips, stalls, 5xx, corrupted bytes
//! - [`FailureType::RateLimited`] - HTTP 429, retried like transient
//! - [`FailureType::Permanent`] - local IO, invalid URL, most 4xx
//!
//! The [`RetryPolicy`] then decides from the task's retry count whether the
//! task goes back to the pending queue and after how long.
//!
//! # Example
//!
//! ```
//! use assetfetch_core::download::{DownloadError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://example.com/a.jar", 503);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, retry_count } => {
//!         println!("retry #{retry_count} in {delay:?}");
//!     }
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay unit, multiplied by the retry count.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Default delay cap.
const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(5000);

/// Classification of transfer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on a later attempt.
    Transient,
    /// Will not succeed regardless of retries.
    Permanent,
    /// Server asked us to slow down.
    RateLimited,
}

/// Decision on whether a failed task goes back to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after `delay`.
    Retry {
        /// Backoff before the task becomes pending again.
        delay: Duration,
        /// The task's retry count after this failure.
        retry_count: u32,
    },

    /// Mark the task failed for good.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Retry budget and backoff configuration.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `base_delay`: 1 second
/// - `max_delay`: 5 seconds
/// - `jitter`: none
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * retry_count, max_delay) + random(0..=jitter)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: Duration::ZERO,
        }
    }

    /// Creates a policy with a custom retry budget and default delays.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Adds up to `jitter` of random delay to every backoff.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retries allowed after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff unit.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Backoff cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Decides what happens to a task that just failed.
    ///
    /// `retry_count` is the task's count *after* counting this failure, so the
    /// task is retried while `retry_count <= max_retries`.
    #[instrument(skip(self), fields(max_retries = self.max_retries))]
    pub fn should_retry(&self, failure_type: FailureType, retry_count: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if retry_count > self.max_retries {
            debug!(retry_count, "retry budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        let delay = self.calculate_delay(retry_count);
        debug!(retry_count, delay_ms = delay.as_millis(), "will retry");

        RetryDecision::Retry { delay, retry_count }
    }

    /// `min(base_delay * retry_count, max_delay) + jitter`
    fn calculate_delay(&self, retry_count: u32) -> Duration {
        let linear = self.base_delay.saturating_mul(retry_count.max(1));
        linear.min(self.max_delay) + self.calculate_jitter()
    }

    fn calculate_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = rand::thread_rng().gen_range(0..=max_ms);
        Duration::from_millis(jitter_ms)
    }
}

/// Classifies a transfer error for retry decisions.
///
/// # HTTP Status Code Classification
///
/// | Status | Type | Rationale |
/// |--------|------|-----------|
/// | 408 | Transient | Request timeout |
/// | 429 | RateLimited | Mirror throttling |
/// | other 4xx | Permanent | Missing or forbidden object |
/// | 5xx | Transient | Mirror or origin hiccup |
///
/// # Non-HTTP Errors
///
/// | Error | Type | Rationale |
/// |-------|------|-----------|
/// | Timeout, Stall | Transient | Connection may recover |
/// | Network (most) | Transient | Server may come back |
/// | Network (TLS) | Permanent | Certificate/config issue |
/// | Integrity, HashMismatch | Transient | Corrupted in transit |
/// | RangeNotSupported | Transient | Next attempt falls back to one stream |
/// | Io, InvalidUrl, Client, Cancelled | Permanent | Retrying cannot help |
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),

        DownloadError::Timeout { .. }
        | DownloadError::Stall { .. }
        | DownloadError::Integrity { .. }
        | DownloadError::HashMismatch { .. }
        | DownloadError::RangeNotSupported { .. } => FailureType::Transient,

        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }

        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::Client { .. }
        | DownloadError::Cancelled { .. } => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.base_delay(), Duration::from_millis(1000));
        assert_eq!(policy.max_delay(), Duration::from_millis(5000));
    }

    #[test]
    fn test_retry_policy_with_max_retries() {
        let policy = RetryPolicy::with_max_retries(5);
        assert_eq!(policy.max_retries(), 5);
        assert_eq!(policy.base_delay(), Duration::from_millis(1000));
    }

    // ==================== Delay Calculation Tests ====================

    #[test]
    fn test_delay_grows_linearly_then_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(1000), Duration::from_millis(5000));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.calculate_delay(5), Duration::from_millis(5000));
        assert_eq!(policy.calculate_delay(9), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(Duration::from_millis(50));
        for _ in 0..20 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    // ==================== should_retry Tests ====================

    #[test]
    fn test_should_retry_until_budget_exhausted() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50));
        for count in 1..=3 {
            assert!(matches!(
                policy.should_retry(FailureType::Transient, count),
                RetryDecision::Retry { retry_count, .. } if retry_count == count
            ));
        }
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 4),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_should_retry_zero_budget_fails_first_time() {
        let policy = RetryPolicy::with_max_retries(0);
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_permanent_never_retries() {
        let policy = RetryPolicy::default();
        match policy.should_retry(FailureType::Permanent, 1) {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("permanent")),
            other => panic!("expected DoNotRetry, got {other:?}"),
        }
    }

    #[test]
    fn test_rate_limited_retries() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.should_retry(FailureType::RateLimited, 1),
            RetryDecision::Retry { .. }
        ));
    }

    // ==================== Classification Tests ====================

    #[test]
    fn test_classify_http_statuses() {
        let cases = [
            (404, FailureType::Permanent),
            (403, FailureType::Permanent),
            (408, FailureType::Transient),
            (429, FailureType::RateLimited),
            (500, FailureType::Transient),
            (503, FailureType::Transient),
            (302, FailureType::Permanent),
        ];
        for (status, expected) in cases {
            let error = DownloadError::http_status("https://x", status);
            assert_eq!(classify_error(&error), expected, "status {status}");
        }
    }

    #[test]
    fn test_classify_transfer_failures_are_retryable() {
        assert_eq!(
            classify_error(&DownloadError::stall("https://x", Duration::from_secs(10))),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&DownloadError::timeout("https://x")),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&DownloadError::hash_mismatch("/a", "x", "y")),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&DownloadError::integrity("/a", 1, 2)),
            FailureType::Transient
        );
    }

    #[test]
    fn test_classify_local_failures_are_permanent() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            classify_error(&DownloadError::io("/a", io)),
            FailureType::Permanent
        );
        assert_eq!(
            classify_error(&DownloadError::invalid_url("nope")),
            FailureType::Permanent
        );
        assert_eq!(
            classify_error(&DownloadError::cancelled("https://x")),
            FailureType::Permanent
        );
    }
}
