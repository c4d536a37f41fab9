use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::BackoffPolicy;
use crate::MemStore;
use crate::MockCoordinationStore;
use crate::SessionId;
use crate::SessionManager;
use crate::Settings;

static LOGGER_INIT: Once = Once::new();

pub fn enable_logger() {
    LOGGER_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    println!("setup logger for unit test.");
}

/// Settings with millisecond-scale timeouts and backoffs
pub fn fast_settings() -> Settings {
    let quick = |max_retries: usize| BackoffPolicy {
        max_retries,
        base_delay_ms: 5,
        max_delay_ms: 40,
    };

    let mut settings = Settings::default();
    settings.session.connect_timeout_ms = 200;
    settings.session.request_timeout_ms = 100;
    settings.session.ensure_connected_timeout_ms = 2000;
    settings.session.jitter = 0.0;
    settings.session.reconnect = quick(0);
    settings.registry.retry = quick(10);
    settings.watch.max_rearm_failures = 3;
    settings.watch.rearm = quick(0);
    settings.writer.max_conflict_retries = 5;
    settings.writer.conflict_backoff = BackoffPolicy {
        max_retries: 0,
        base_delay_ms: 1,
        max_delay_ms: 5,
    };
    settings.writer.transient = quick(5);
    settings
}

/// Store plus a started session manager, connected before returning
pub async fn connected_session() -> (Arc<MemStore>, Arc<SessionManager>) {
    let store = Arc::new(MemStore::new());
    let session = SessionManager::new(store.clone(), fast_settings().session);
    session.start();
    if let Err(e) = session.ensure_connected().await {
        panic!("session did not connect: {e:?}");
    }
    (store, session)
}

/// Session manager over a mock, connected by one attempt without the reconnect loop
pub async fn mock_session(mut store: MockCoordinationStore) -> Arc<SessionManager> {
    let (events_tx, _) = broadcast::channel(1);
    store.expect_connect().returning(|_| Ok(SessionId(1)));
    store.expect_session_events().returning(move || events_tx.subscribe());
    let session = SessionManager::new(Arc::new(store), fast_settings().session);
    if let Err(e) = session.connect().await {
        panic!("mock session did not connect: {e:?}");
    }
    session
}

pub fn value(
    store: &MemStore,
    path: &str,
) -> Option<Bytes> {
    store.node(path).map(|(data, _)| data)
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
