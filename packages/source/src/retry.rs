//! Retry classification and backoff for source downloads.
//!
//! Connection errors, timeouts, interrupted bodies, HTTP 429, and HTTP 5xx
//! are transient and retried with exponential backoff. Every other 4xx is
//! permanent.

use std::time::Duration;

/// Upper bound on a single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Delay before retry number `retry` (1-based): `base × 2^(retry-1)`,
/// capped at five minutes.
#[must_use]
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let factor = 1u32 << retry.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_DELAY)
}

/// Returns `true` if the error is likely transient and worth retrying.
#[must_use]
pub fn is_transient(e: &reqwest::Error) -> bool {
    if let Some(status) = e.status() {
        return is_transient_status(status.as_u16());
    }
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}

/// Returns `true` for 429 Too Many Requests and 5xx server errors.
#[must_use]
pub const fn is_transient_status(status: u16) -> bool {
    status == 429 || (status >= 500 && status < 600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(Duration::ZERO, 5), Duration::ZERO);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(Duration::from_secs(10), 30), MAX_DELAY);
    }

    #[test]
    fn status_classification() {
        assert!(is_transient_status(429));
        assert!(is_transient_status(500));
        assert!(is_transient_status(503));
        assert!(!is_transient_status(404));
        assert!(!is_transient_status(403));
        assert!(!is_transient_status(200));
    }
}
