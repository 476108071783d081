//! Shared error-classification vocabulary (§7, §9).
//!
//! Each layer (`gateway`, `fetch`, `executor`, `webhook`) defines its own
//! `thiserror` enum rather than sharing one flat error type, but all of them
//! implement [`Classify`] so [`crate::chunked`] and [`crate::runtime`] can
//! decide retry policy without matching on layer-specific variants.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying under the backoff policy in §4.5.
    Retryable { retry_after: Option<Duration> },
    /// Not worth retrying; surfaced to the caller as-is.
    Fatal,
}

pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

/// Classifies a transport-level failure the way §4.5 enumerates it:
/// connect/timeout errors, 5xx, 429, 408 are retryable; everything else is
/// fatal for the current attempt.
pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorClass {
    if err.is_connect() || err.is_timeout() {
        return ErrorClass::Retryable { retry_after: None };
    }
    if let Some(status) = err.status() {
        return classify_status(status.as_u16(), None);
    }
    ErrorClass::Fatal
}

pub fn classify_status(status: u16, retry_after: Option<Duration>) -> ErrorClass {
    match status {
        429 => ErrorClass::Retryable { retry_after },
        408 => ErrorClass::Retryable { retry_after: None },
        s if s >= 500 => ErrorClass::Retryable { retry_after: None },
        _ => ErrorClass::Fatal,
    }
}

/// Exponential backoff per §4.5: `min(rateLimitDelayMs * 2^attempt, 30s)`,
/// unless the upstream handed us an explicit `Retry-After`.
pub fn backoff_delay(rate_limit_delay_ms: u64, attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(d) = retry_after {
        return d;
    }
    let scaled = rate_limit_delay_ms.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(scaled.min(30_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_as_retryable_with_retry_after() {
        let class = classify_status(429, Some(Duration::from_secs(2)));
        assert_eq!(
            class,
            ErrorClass::Retryable {
                retry_after: Some(Duration::from_secs(2))
            }
        );
    }

    #[test]
    fn classifies_client_errors_as_fatal() {
        assert_eq!(classify_status(404, None), ErrorClass::Fatal);
        assert_eq!(classify_status(401, None), ErrorClass::Fatal);
    }

    #[test]
    fn classifies_server_errors_as_retryable() {
        assert_eq!(
            classify_status(503, None),
            ErrorClass::Retryable { retry_after: None }
        );
    }

    #[test]
    fn backoff_caps_at_30s() {
        let d = backoff_delay(1_000, 20, None);
        assert_eq!(d, Duration::from_millis(30_000));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(100, 0, None), Duration::from_millis(100));
        assert_eq!(backoff_delay(100, 1, None), Duration::from_millis(200));
        assert_eq!(backoff_delay(100, 2, None), Duration::from_millis(400));
    }

    #[test]
    fn backoff_prefers_retry_after() {
        assert_eq!(
            backoff_delay(100, 5, Some(Duration::from_secs(9))),
            Duration::from_secs(9)
        );
    }
}
