//! Retry with exponential backoff for transient provider failures.
//!
//! Backoff: 1 s, 2 s, 4 s, 8 s … capped at 60 s, max 5 attempts.
//! `Retry-After` overrides the computed delay when present. Permanent
//! errors (4xx without retry semantics) abort immediately. When the
//! final failure is a rate limit, the caller receives
//! [`Error::RateLimited`] and may route the turn to a fallback model.

use std::future::Future;
use std::time::Duration;

use hearth_domain::error::{Error, Result};

pub const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Delay before retrying after `attempt` failures (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = BASE_DELAY.saturating_mul(1u32 << exp);
    delay.min(MAX_DELAY)
}

/// Run `operation` with retries. `on_retry(attempt, error, delay)` is
/// invoked before each sleep — the orchestrator uses it to audit every
/// provider retry.
pub async fn with_retry<T, F, Fut, C>(mut operation: F, mut on_retry: C) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: FnMut(u32, &Error, Duration),
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = match &error {
                    Error::RateLimited {
                        retry_after: Some(after),
                    } => (*after).min(MAX_DELAY),
                    _ => backoff_delay(attempt),
                };
                on_retry(attempt, &error, delay);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient provider error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}
