use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::BackoffPolicy;
use crate::ConnectionError;
use crate::Result;

/// Exponential delay for the `attempt`-th failure (1-based), capped at `max_delay`.
pub(crate) fn backoff_delay(
    policy: &BackoffPolicy,
    attempt: usize,
) -> Duration {
    let exp = attempt.saturating_sub(1).min(31) as u32;
    let delay = policy.base_delay_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(delay.min(policy.max_delay_ms))
}

/// [`backoff_delay`] scaled by a random factor in `[1 - jitter, 1 + jitter]`, never above
/// `max_delay`.
pub(crate) fn jittered_delay(
    policy: &BackoffPolicy,
    attempt: usize,
    jitter: f64,
) -> Duration {
    let delay = backoff_delay(policy, attempt);
    if jitter <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor).min(policy.max_delay())
}

/// Sleeps for `delay` unless `cancel` fires first. Returns false when cancelled.
pub(crate) async fn sleep_or_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Runs one store round trip under `duration`; an elapsed deadline becomes a transient
/// [`ConnectionError::Timeout`].
pub(crate) async fn with_timeout<T, F>(
    operation: &'static str,
    duration: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout { operation, duration }.into()),
    }
}
