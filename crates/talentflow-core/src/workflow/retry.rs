//! Handler-local retry for collaborator calls.
//!
//! The engine never re-runs a failed handler on its own; an `api_call` step
//! may carry a `RetryPolicy` that is applied here, inside one handler run.

use std::future::Future;
use std::time::Duration;

use talentflow_types::workflow::RetryPolicy;

use super::collaborator::CollaboratorError;

/// Delay to wait after failed attempt number `attempt` (1-based).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let millis = policy.backoff_ms as f64 * policy.backoff_multiplier.max(1.0).powi(exponent);
    Duration::from_millis(millis.min(u64::MAX as f64) as u64)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted.
///
/// Returns the final result together with the number of attempts made.
pub async fn with_retry<T, F, Fut>(
    policy: Option<&RetryPolicy>,
    mut op: F,
) -> (Result<T, CollaboratorError>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let max_attempts = policy.map(|p| p.max_attempts.max(1)).unwrap_or(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if attempt < max_attempts && err.is_retryable() => {
                let delay = policy.map(|p| backoff_delay(p, attempt)).unwrap_or_default();
                tracing::debug!(attempt, error = %err, ?delay, "retrying collaborator call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}
