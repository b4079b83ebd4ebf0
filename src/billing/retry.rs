use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Explicit retry policy for background tasks: a task runs at most
/// `1 + max_retries` times, sleeping `delay` between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

/// Drive `task` under `policy` until it succeeds, fails with a
/// non-retryable error, or runs out of attempts.
///
/// `retryable` classifies errors; non-retryable ones return immediately and
/// never reach `on_exhausted`. The hook fires exactly once, when a retryable
/// error has consumed every attempt.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    mut task: F,
    retryable: impl Fn(&E) -> bool,
    mut on_exhausted: impl FnMut(&E),
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match task(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) && attempt < policy.max_retries => {
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    error = %e,
                    "task failed, retrying after delay"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => {
                if retryable(&e) {
                    on_exhausted(&e);
                }
                return Err(e);
            }
        }
    }
}
