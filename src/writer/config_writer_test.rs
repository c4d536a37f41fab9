use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::test_utils::connected_session;
use crate::test_utils::enable_logger;
use crate::test_utils::fast_settings;
use crate::test_utils::mock_session;
use crate::test_utils::value;
use crate::ConfigNode;
use crate::ConnectionError;
use crate::Error;
use crate::MemStore;
use crate::MockCoordinationStore;
use crate::NodeRegistry;
use crate::SessionManager;
use crate::Stat;
use crate::StoreError;

async fn writer_with_node(initial: &str) -> (Arc<MemStore>, ConfigWriter) {
    let (store, session) = connected_session().await;
    NodeRegistry::new(session.clone(), fast_settings().registry)
        .ensure_exists("/config/db_url", Bytes::copy_from_slice(initial.as_bytes()))
        .await
        .unwrap();
    (store, ConfigWriter::new(session, fast_settings().writer))
}

fn stat(version: u64) -> Stat {
    Stat {
        version,
        ..Stat::default()
    }
}

#[tokio::test]
async fn test_update_bumps_version() {
    enable_logger();
    let (store, writer) = writer_with_node("127.0.0.1").await;

    let node = writer.update("/config/db_url", "10.0.0.5").await.unwrap();

    assert_eq!(node.value, Bytes::from("10.0.0.5"));
    assert_eq!(node.version, 1);
    assert_eq!(value(&store, "/config/db_url"), Some(Bytes::from("10.0.0.5")));
}

#[tokio::test]
async fn test_update_missing_node_is_store_error() {
    let (_store, writer) = writer_with_node("x").await;

    let err = writer.update("/config/missing", "v").await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::NoNode { .. })));
}

#[tokio::test]
async fn test_conflict_recomputes_against_fresh_read() {
    let (store, writer) = writer_with_node("1").await;
    let calls = AtomicUsize::new(0);

    let node = writer
        .update_with("/config/db_url", &CancellationToken::new(), |current| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                // a competing writer sneaks in between our read and write
                store.external_set("/config/db_url", "5").unwrap();
            }
            let n: u64 = current.value_str().parse().unwrap();
            Bytes::from((n + 1).to_string())
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(node.value, Bytes::from("6"));
    assert_eq!(node.version, 2);
}

#[tokio::test]
async fn test_concurrent_updates_never_lose_both() {
    let (store, writer) = writer_with_node("a").await;
    store.set_latency(Duration::from_millis(5));

    let (first, second) = tokio::join!(
        writer.update("/config/db_url", "from-first"),
        writer.update("/config/db_url", "from-second"),
    );

    let (stored, stat) = store.node("/config/db_url").unwrap();
    let mut landed = Vec::new();
    for result in [first, second] {
        match result {
            Ok(node) => landed.push(node),
            Err(Error::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(!landed.is_empty());
    let latest = landed.iter().max_by_key(|n| n.version).unwrap();
    assert_eq!(latest.value, stored);
    assert_eq!(latest.version, stat.version);
}

#[tokio::test]
async fn test_conflict_budget_surfaces_conflict_error() {
    let mut store = MockCoordinationStore::new();
    store
        .expect_get_data()
        .times(6)
        .returning(|_, _| Ok((Bytes::from("old"), stat(3))));
    store.expect_set_data().times(6).returning(|_, path, _, expected| {
        Err(StoreError::BadVersion {
            path: path.to_string(),
            expected,
            actual: Some(expected + 1),
        }
        .into())
    });
    let session = mock_session(store).await;
    let writer = ConfigWriter::new(session, fast_settings().writer);

    let err = writer.update("/config/db_url", "new").await.unwrap_err();
    match err {
        Error::Conflict(conflict) => {
            // first attempt plus max_conflict_retries
            assert_eq!(conflict.attempts, 6);
            // the version that won, not the one we read
            assert_eq!(conflict.last_seen_version, 4);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_transient_budget_surfaces_connection_error() {
    let mut store = MockCoordinationStore::new();
    store
        .expect_get_data()
        .times(6)
        .returning(|_, _| Err(ConnectionError::ConnectionLoss.into()));
    store.expect_set_data().times(0);
    let session = mock_session(store).await;
    let writer = ConfigWriter::new(session, fast_settings().writer);

    let err = writer.update("/config/db_url", "new").await.unwrap_err();
    assert!(matches!(err, Error::Connection(ConnectionError::ConnectionLoss)));
}

#[tokio::test]
async fn test_timed_out_write_that_landed_is_not_repeated() {
    let reads = Arc::new(AtomicUsize::new(0));
    let mut store = MockCoordinationStore::new();
    {
        let reads = reads.clone();
        store.expect_get_data().returning(move |_, _| {
            if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok((Bytes::from("old"), stat(0)))
            } else {
                Ok((Bytes::from("new"), stat(1)))
            }
        });
    }
    store.expect_set_data().times(1).returning(|_, _, _, _| {
        Err(ConnectionError::Timeout {
            operation: "set_data",
            duration: Duration::from_millis(100),
        }
        .into())
    });
    let session = mock_session(store).await;
    let writer = ConfigWriter::new(session, fast_settings().writer);

    let node = writer.update("/config/db_url", "new").await.unwrap();

    assert_eq!(node.version, 1);
    assert_eq!(reads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_timed_out_increment_is_recomputed_when_another_writer_matches_it() {
    let reads = Arc::new(AtomicUsize::new(0));
    let mut store = MockCoordinationStore::new();
    {
        let reads = reads.clone();
        store.expect_get_data().returning(move |_, _| {
            if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok((Bytes::from("0"), stat(0)))
            } else {
                // another incrementer got "1" in first
                Ok((Bytes::from("1"), stat(1)))
            }
        });
    }
    let writes = Arc::new(AtomicUsize::new(0));
    {
        let writes = writes.clone();
        store.expect_set_data().times(2).returning(move |_, _, value, expected| {
            if writes.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ConnectionError::Timeout {
                    operation: "set_data",
                    duration: Duration::from_millis(100),
                }
                .into());
            }
            assert_eq!(value, Bytes::from("2"));
            assert_eq!(expected, 1);
            Ok(stat(2))
        });
    }
    let session = mock_session(store).await;
    let writer = ConfigWriter::new(session, fast_settings().writer);

    let node = writer
        .update_with("/counter", &CancellationToken::new(), |current| {
            let n: u64 = current.value_str().parse().unwrap();
            Bytes::from((n + 1).to_string())
        })
        .await
        .unwrap();

    assert_eq!(node.value, Bytes::from("2"));
    assert_eq!(node.version, 2);
    assert_eq!(writes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_increments_from_concurrent_writers_are_all_applied() {
    let (store, writer) = writer_with_node("0").await;
    store.set_latency(Duration::from_millis(2));
    let increment = |current: &ConfigNode| {
        let n: u64 = current.value_str().parse().unwrap();
        Bytes::from((n + 1).to_string())
    };

    let (cancel_a, cancel_b) = (CancellationToken::new(), CancellationToken::new());
    let (first, second) = tokio::join!(
        writer.update_with("/config/db_url", &cancel_a, increment),
        writer.update_with("/config/db_url", &cancel_b, increment),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(value(&store, "/config/db_url"), Some(Bytes::from("2")));
}

#[tokio::test]
async fn test_round_trips_are_bounded_by_request_timeout() {
    let store = Arc::new(MemStore::new());
    let mut settings = fast_settings();
    settings.session.request_timeout_ms = 1000;
    let session = SessionManager::new(store.clone(), settings.session);
    session.start();
    session.ensure_connected().await.unwrap();
    NodeRegistry::new(session.clone(), settings.registry)
        .ensure_exists("/config", "")
        .await
        .unwrap();
    let writer = ConfigWriter::new(session.clone(), settings.writer);

    // slower than the fast default of 100ms, well within 1000ms
    store.set_latency(Duration::from_millis(300));
    let node = writer.update("/config", "slow").await.unwrap();

    assert_eq!(node.version, 1);
    session.stop().await;
}

#[tokio::test]
async fn test_cancelled_update_does_not_write() {
    let (store, writer) = writer_with_node("keep").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = writer
        .update_with("/config/db_url", &cancel, |_| Bytes::from("lost"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled { ref path } if path == "/config/db_url"));
    assert_eq!(value(&store, "/config/db_url"), Some(Bytes::from("keep")));
}

#[tokio::test]
async fn test_cancel_during_conflict_backoff() {
    let mut store = MockCoordinationStore::new();
    store
        .expect_get_data()
        .times(1)
        .returning(|_, _| Ok((Bytes::from("old"), stat(0))));
    store.expect_set_data().times(1).returning(|_, path, _, expected| {
        Err(StoreError::BadVersion {
            path: path.to_string(),
            expected,
            actual: Some(1),
        }
        .into())
    });
    let session = mock_session(store).await;
    let mut config = fast_settings().writer;
    config.conflict_backoff.base_delay_ms = 500;
    config.conflict_backoff.max_delay_ms = 500;
    let writer = ConfigWriter::new(session, config);
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };
    let err = writer
        .update_with("/config/db_url", &cancel, |_| Bytes::from("new"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled { .. }));
    canceller.await.unwrap();
}
