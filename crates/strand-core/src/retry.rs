use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Result, StrandError};

/// Classify whether an error looks transient enough to retry.
///
/// Recognizes rate-limit, server-error, and connection-reset signatures by
/// message inspection. Advisory only; callers may retry regardless.
pub fn is_retryable(e: &StrandError) -> bool {
    match e {
        StrandError::ModelRequest(msg) => {
            msg.contains("429")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("504")
                || msg.contains("500")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        StrandError::ModelStream(_) => true,
        _ => false,
    }
}

/// Backoff for a 1-based attempt number: `backoff_ms * multiplier^(attempt-1)`,
/// capped at `max_backoff_ms`.
pub fn backoff_for_attempt(attempt: u32, config: &RetryConfig) -> Duration {
    let exp = attempt.saturating_sub(1);
    let ms = (config.backoff_ms as f64 * config.backoff_multiplier.powi(exp as i32))
        .min(config.max_backoff_ms as f64);
    Duration::from_millis(ms as u64)
}

/// Run `operation` until it succeeds or the attempt budget is exhausted.
///
/// After `max_attempts` failures the last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_notify(config, operation, |_, _| {}).await
}

/// Like [`with_retry`], invoking `on_retry(attempt, &error)` before each
/// backoff sleep. `attempt` is the 1-based number of the attempt that failed.
pub async fn with_retry_notify<T, F, Fut, N>(
    config: &RetryConfig,
    mut operation: F,
    mut on_retry: N,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(u32, &StrandError),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                let backoff = backoff_for_attempt(attempt, config);
                warn!(
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                on_retry(attempt, &e);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
