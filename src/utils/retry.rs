//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for plugin callback pings.
///
/// - Min delay: 100ms
/// - Max delay: 1s
/// - Max attempts: 2
/// - Jitter enabled
pub fn callback_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(2)
        .with_jitter()
}

/// Backoff for opening the topology store at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 10
/// - Jitter enabled
pub fn store_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Connection failures and timeouts are worth another attempt.
pub fn is_retryable_http(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Server errors and rate limiting are worth another attempt. Client
/// errors (bad credentials, unknown path) are not.
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
