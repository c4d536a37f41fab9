use std::time::Duration;

use bytes::Bytes;
use confwatch::ChangeSource;
use confwatch::Error;
use confwatch::WatchEvent;

use crate::common::change_with_value;
use crate::common::client;
use crate::common::client_with_db_url;
use crate::common::drain;
use crate::common::next_event;
use crate::common::DB_URL;

#[tokio::test]
async fn test_bootstrap_update_and_watch_db_url() {
    let (store, client) = client().await;

    client.ensure_exists("/config", "").await.unwrap();
    let node = client.ensure_exists(DB_URL, "127.0.0.1").await.unwrap();
    assert_eq!(node.value, Bytes::from("127.0.0.1"));
    assert_eq!(node.version, 0);

    let mut stream = client.watch(DB_URL).await.unwrap();
    let node = client.update(DB_URL, "10.0.0.5").await.unwrap();
    assert_eq!(node.version, 1);

    let events = drain(&mut stream, Duration::from_millis(300)).await;
    assert_eq!(events.len(), 1, "{events:?}");
    match &events[0] {
        WatchEvent::Changed(change) => {
            assert_eq!(change.value, Some(Bytes::from("10.0.0.5")));
            assert_eq!(change.version, Some(1));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(store.node(DB_URL).unwrap().1.version, 1);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ensure_exists_creates_exactly_one_node() {
    let (store, client) = client().await;
    client.ensure_exists("/config", "").await.unwrap();
    store.set_latency(Duration::from_millis(2));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.ensure_exists(DB_URL, format!("default-{i}")).await
        }));
    }
    let mut values = Vec::new();
    for task in tasks {
        values.push(task.await.unwrap().unwrap().value);
    }

    let (stored, stat) = store.node(DB_URL).unwrap();
    assert_eq!(stat.version, 0);
    assert!(values.iter().all(|v| *v == stored), "{values:?} vs {stored:?}");

    client.shutdown().await;
}

#[tokio::test]
async fn test_burst_of_updates_ends_on_the_last_value() {
    let (_store, client) = client_with_db_url().await;
    let mut stream = client.watch(DB_URL).await.unwrap();

    for i in 1..=20 {
        client.update(DB_URL, format!("10.0.0.{i}")).await.unwrap();
    }

    let last = change_with_value(&mut stream, "10.0.0.20").await;
    assert_eq!(last.version, Some(20));
    assert_eq!(last.source, ChangeSource::Notification);

    client.shutdown().await;
}

#[tokio::test]
async fn test_delivered_versions_only_increase() {
    let (_store, client) = client_with_db_url().await;
    let mut stream = client.watch(DB_URL).await.unwrap();

    for i in 1..=10 {
        client.update(DB_URL, format!("v{i}")).await.unwrap();
        tokio::task::yield_now().await;
    }
    change_with_value(&mut stream, "v10").await;
    client.update(DB_URL, "v11").await.unwrap();

    let mut previous = 10;
    loop {
        match next_event(&mut stream).await {
            WatchEvent::Changed(change) => {
                let version = change.version.unwrap();
                assert!(version > previous);
                previous = version;
                if version == 11 {
                    break;
                }
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_are_conflict_safe() {
    let (store, client) = client_with_db_url().await;
    store.set_latency(Duration::from_millis(3));

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.update(DB_URL, "from-first").await })
    };
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.update(DB_URL, "from-second").await })
    };

    let mut landed = Vec::new();
    for result in [first.await.unwrap(), second.await.unwrap()] {
        match result {
            Ok(node) => landed.push(node),
            Err(Error::Conflict(conflict)) => assert_eq!(conflict.path, DB_URL),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    let (stored, stat) = store.node(DB_URL).unwrap();
    assert!(stored == Bytes::from("from-first") || stored == Bytes::from("from-second"));
    let latest = landed.iter().max_by_key(|n| n.version).expect("one writer wins");
    assert_eq!(latest.value, stored);
    assert_eq!(latest.version, stat.version);

    client.shutdown().await;
}
