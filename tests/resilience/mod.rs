use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use confwatch::ChangeSource;
use confwatch::LifecycleEvent;
use confwatch::WatchEvent;
use parking_lot::Mutex;

use crate::common::change_with_value;
use crate::common::client_with_db_url;
use crate::common::drain;
use crate::common::DB_URL;

#[tokio::test]
async fn test_change_made_while_disconnected_is_reconciled() {
    let (store, client) = client_with_db_url().await;
    client.update(DB_URL, "A").await.unwrap();
    let mut stream = client.watch(DB_URL).await.unwrap();
    assert_eq!(stream.initial().unwrap().value, Bytes::from("A"));

    store.set_available(false);
    store.disconnect_all();
    store.external_set(DB_URL, "B").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.set_available(true);

    let change = change_with_value(&mut stream, "B").await;
    assert_eq!(change.source, ChangeSource::Reconciliation);

    client.shutdown().await;
}

#[tokio::test]
async fn test_session_expiry_rearms_without_degraded_notice() {
    let (store, client) = client_with_db_url().await;
    let mut stream = client.watch(DB_URL).await.unwrap();
    let mut lifecycle = client.session().subscribe();

    store.expire_all();
    loop {
        match tokio::time::timeout(Duration::from_secs(2), lifecycle.recv()).await.unwrap().unwrap() {
            LifecycleEvent::Connected { resumed, .. } => {
                assert!(!resumed);
                break;
            }
            _ => continue,
        }
    }
    client.update(DB_URL, "after-expiry").await.unwrap();

    let events = drain(&mut stream, Duration::from_millis(400)).await;
    assert!(
        !events.iter().any(|e| matches!(e, WatchEvent::Degraded { .. })),
        "{events:?}"
    );
    assert!(events.iter().any(|e| matches!(
        e,
        WatchEvent::Changed(change) if change.value == Some(Bytes::from("after-expiry"))
    )));

    client.shutdown().await;
}

#[tokio::test]
async fn test_update_rides_out_a_short_outage() {
    let (store, client) = client_with_db_url().await;

    store.set_available(false);
    store.disconnect_all();
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.update(DB_URL, "10.0.0.7").await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    store.set_available(true);

    let node = pending.await.unwrap().unwrap();
    assert_eq!(node.version, 1);
    assert_eq!(store.node(DB_URL).unwrap().0, Bytes::from("10.0.0.7"));

    client.shutdown().await;
}

#[tokio::test]
async fn test_no_callback_after_stop() {
    let (store, client) = client_with_db_url().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let seen = seen.clone();
        client
            .watch_with(DB_URL, move |event| {
                if let WatchEvent::Changed(change) = event {
                    seen.lock().push(change.value);
                }
            })
            .await
            .unwrap()
    };

    client.update(DB_URL, "before-stop").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while seen.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    handle.stop().await;
    store.external_set(DB_URL, "after-stop").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(*seen.lock(), vec![Some(Bytes::from("before-stop"))]);
    assert!(client.watcher().watched_paths().is_empty());

    client.shutdown().await;
}
