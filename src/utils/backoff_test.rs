use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::backoff::*;
use crate::BackoffPolicy;
use crate::ConnectionError;
use crate::Error;

fn policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        base_delay_ms: 100,
        max_delay_ms: 1000,
    }
}

#[test]
fn test_backoff_delay_doubles_until_cap() {
    let p = policy();
    assert_eq!(backoff_delay(&p, 1), Duration::from_millis(100));
    assert_eq!(backoff_delay(&p, 2), Duration::from_millis(200));
    assert_eq!(backoff_delay(&p, 4), Duration::from_millis(800));
    assert_eq!(backoff_delay(&p, 5), Duration::from_millis(1000));
    assert_eq!(backoff_delay(&p, 500), Duration::from_millis(1000));
}

#[test]
fn test_jittered_delay_stays_within_bounds() {
    let p = policy();
    for attempt in 1..8 {
        let base = backoff_delay(&p, attempt);
        for _ in 0..50 {
            let d = jittered_delay(&p, attempt, 0.5);
            assert!(d >= base.mul_f64(0.5), "{d:?} below lower bound of {base:?}");
            assert!(d <= p.max_delay());
        }
    }
}

#[test]
fn test_zero_jitter_is_deterministic() {
    let p = policy();
    assert_eq!(jittered_delay(&p, 3, 0.0), backoff_delay(&p, 3));
}

#[tokio::test]
async fn test_with_timeout_maps_elapsed_to_transient_error() {
    let result: crate::Result<()> = with_timeout("get_data", Duration::from_millis(10), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    })
    .await;

    let err = result.unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(
        err,
        Error::Connection(ConnectionError::Timeout {
            operation: "get_data",
            ..
        })
    ));
}

#[tokio::test]
async fn test_with_timeout_passes_through_result() {
    let result = with_timeout("exists", Duration::from_secs(1), async { Ok(7) }).await;
    assert_eq!(result.unwrap(), 7);
}

#[tokio::test]
async fn test_sleep_or_cancel_returns_early_on_cancel() {
    let token = CancellationToken::new();
    token.cancel();
    assert!(!sleep_or_cancel(Duration::from_secs(60), &token).await);
    assert!(sleep_or_cancel(Duration::from_millis(1), &CancellationToken::new()).await);
}
