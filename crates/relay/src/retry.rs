use std::future::Future;

use tracing::warn;

use waline_core::{RelayError, RetryPolicy};

/// Drive one outbound platform call under the bounded backoff policy.
///
/// Retries only errors the taxonomy classifies as retryable; structural
/// failures surface immediately. The attempt budget bounds total latency on
/// top of the per-attempt timeouts the transports already carry.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    event_name = "relay.retry.backoff",
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "call failed; backing off before retry"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(error) => return Err(error),
        }
    }
}
