use crate::config::RetryPolicy;
use crate::error::CanonResult;
use std::future::Future;
use tracing::debug;

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only transient store failures are retried, with exponential backoff.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> CanonResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CanonResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                debug!(
                    what,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}
