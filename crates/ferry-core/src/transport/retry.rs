//! Retry policy and failure classification.
//!
//! Only throttling and server-side statuses (429, 500, 502, 503, 504) and
//! connection-level failures whose text matches a known transient-network
//! signature are retried. Everything else surfaces on the first attempt.

use std::time::Duration;

use rand::Rng;

use super::{FailureKind, TransportFailure};

/// Statuses that are retried.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Upper bound of the jitter, as a fraction of the computed delay.
pub const MAX_JITTER_FRACTION: f64 = 0.2;

/// Hard ceiling for a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Lower-cased fragments of connection-level failures worth retrying.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "connection reset",
    "reset by peer",
    "connection was reset",
    "connection aborted",
    "connection closed",
    "broken pipe",
    "unexpected eof",
    "tls handshake",
    "handshake failure",
    "certificate",
    "ssl",
    "error reading",
    "error decoding response body",
    "recv failure",
    "failure when receiving data",
    "empty reply from server",
    "timed out",
];

/// Lower-cased fragments identifying TLS or certificate failures.
const TLS_SIGNATURES: &[&str] = &[
    "certificate",
    "tls",
    "ssl",
    "handshake",
    "unknownissuer",
    "self signed",
    "self-signed",
];

/// How many times to attempt a request and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Whether another attempt may follow attempt number `attempt`
    /// (1-based).
    #[must_use]
    pub const fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay after the `attempt`-th failure (1-based), with random jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..=MAX_JITTER_FRACTION);
        self.backoff(attempt, jitter)
    }

    /// `base_delay * 2^(attempt - 1) * (1 + jitter)`, capped at
    /// [`MAX_BACKOFF`]. `jitter` is clamped to `[0, MAX_JITTER_FRACTION]`.
    #[must_use]
    pub fn backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1).min(62)).unwrap_or(62);
        let jitter = if jitter.is_nan() {
            0.0
        } else {
            jitter.clamp(0.0, MAX_JITTER_FRACTION)
        };
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent) * (1.0 + jitter);
        Duration::from_secs_f64(secs.min(MAX_BACKOFF.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    /// Default: 4 attempts, 1s base delay.
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Whether an HTTP status is retried.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Whether a connection-level failure is transient.
#[must_use]
pub fn is_transient_failure(failure: &TransportFailure) -> bool {
    if matches!(failure.kind, FailureKind::Timeout | FailureKind::Tls) {
        return true;
    }
    let message = failure.message.to_ascii_lowercase();
    TRANSIENT_SIGNATURES
        .iter()
        .any(|signature| message.contains(signature))
}

/// Whether a failure is a TLS or certificate failure.
#[must_use]
pub fn is_tls_failure(failure: &TransportFailure) -> bool {
    if failure.kind == FailureKind::Tls {
        return true;
    }
    let message = failure.message.to_ascii_lowercase();
    TLS_SIGNATURES
        .iter()
        .any(|signature| message.contains(signature))
}

/// Classifies raw transport error text.
#[must_use]
pub fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        FailureKind::Timeout
    } else if TLS_SIGNATURES.iter().any(|s| lower.contains(s)) {
        FailureKind::Tls
    } else {
        FailureKind::Connection
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn failure(kind: FailureKind, message: &str) -> TransportFailure {
        TransportFailure::new(kind, message)
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn zero_attempts_is_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn allows_retry_within_budget() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        assert!(policy.allows_retry_after(1));
        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));
    }

    #[test]
    fn backoff_without_jitter_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.backoff(1, 0.0), Duration::from_millis(100));
        assert_eq!(policy.backoff(2, 0.0), Duration::from_millis(200));
        assert_eq!(policy.backoff(3, 0.0), Duration::from_millis(400));
    }

    #[test]
    fn backoff_jitter_is_clamped() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        assert!((policy.backoff(1, 5.0).as_secs_f64() - 1.2).abs() < 1e-6);
        assert_eq!(policy.backoff(1, -1.0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1, f64::NAN), Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::new(100, Duration::from_secs(10));
        assert_eq!(policy.backoff(90, 0.2), MAX_BACKOFF);
    }

    #[test]
    fn retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{status}");
        }
        for status in [400, 401, 403, 404, 409, 501] {
            assert!(!is_retryable_status(status), "{status}");
        }
    }

    #[test]
    fn transient_signatures() {
        assert!(is_transient_failure(&failure(
            FailureKind::Connection,
            "connection reset by peer (os error 104)"
        )));
        assert!(is_transient_failure(&failure(
            FailureKind::Tls,
            "invalid peer certificate: UnknownIssuer"
        )));
        assert!(is_transient_failure(&failure(
            FailureKind::Connection,
            "error decoding response body"
        )));
        assert!(is_transient_failure(&failure(FailureKind::Timeout, "deadline")));
        assert!(!is_transient_failure(&failure(
            FailureKind::Connection,
            "connection refused (os error 111)"
        )));
        assert!(!is_transient_failure(&failure(
            FailureKind::Connection,
            "dns error: failed to lookup address"
        )));
    }

    #[test]
    fn tls_detection() {
        assert!(is_tls_failure(&failure(
            FailureKind::Connection,
            "SSL certificate problem: self signed certificate"
        )));
        assert!(!is_tls_failure(&failure(
            FailureKind::Connection,
            "connection reset by peer"
        )));
        assert_eq!(classify_message("operation timed out"), FailureKind::Timeout);
        assert_eq!(classify_message("invalid peer certificate"), FailureKind::Tls);
        assert_eq!(classify_message("connection refused"), FailureKind::Connection);
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic(
            base_ms in 1u64..5_000,
            attempt in 1u32..12,
            j1 in 0.0f64..=MAX_JITTER_FRACTION,
            j2 in 0.0f64..=MAX_JITTER_FRACTION,
        ) {
            let policy = RetryPolicy::new(16, Duration::from_millis(base_ms));
            prop_assert!(policy.backoff(attempt + 1, j2) >= policy.backoff(attempt, j1));
        }

        #[test]
        fn prop_backoff_is_bounded(
            base_ms in 1u64..5_000,
            attempt in 1u32..12,
            jitter in 0.0f64..=MAX_JITTER_FRACTION,
        ) {
            let policy = RetryPolicy::new(16, Duration::from_millis(base_ms));
            let bound = Duration::from_millis(base_ms).as_secs_f64()
                * 2f64.powi(i32::try_from(attempt).unwrap())
                * (1.0 + MAX_JITTER_FRACTION);
            prop_assert!(policy.backoff(attempt, jitter).as_secs_f64() <= bound);
        }
    }
}
