use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use confwatch::BackoffPolicy;
use confwatch::ConfigChangeEvent;
use confwatch::ConfigClient;
use confwatch::MemStore;
use confwatch::Settings;
use confwatch::WatchEvent;
use confwatch::WatchStream;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

pub const DB_URL: &str = "/config/db_url";

static LOGGER_INIT: Once = Once::new();

pub fn enable_logger() {
    LOGGER_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn fast_settings() -> Settings {
    let quick = |max_retries: usize| BackoffPolicy {
        max_retries,
        base_delay_ms: 5,
        max_delay_ms: 40,
    };

    let mut settings = Settings::default();
    settings.session.connect_timeout_ms = 200;
    settings.session.request_timeout_ms = 100;
    settings.session.ensure_connected_timeout_ms = 3000;
    settings.session.jitter = 0.1;
    settings.session.reconnect = quick(0);
    settings.registry.retry = quick(20);
    settings.watch.max_rearm_failures = 3;
    settings.watch.rearm = quick(0);
    settings.writer.conflict_backoff = quick(0);
    settings.writer.conflict_backoff.base_delay_ms = 1;
    settings.writer.transient = quick(20);
    settings
}

pub async fn client() -> (Arc<MemStore>, ConfigClient) {
    enable_logger();
    let store = Arc::new(MemStore::new());
    let client = ConfigClient::builder(store.clone())
        .settings(fast_settings())
        .build()
        .await
        .expect("client connects");
    (store, client)
}

/// Client with `/config/db_url` bootstrapped to its default
pub async fn client_with_db_url() -> (Arc<MemStore>, ConfigClient) {
    let (store, client) = client().await;
    client.ensure_exists("/config", "").await.expect("base path");
    client.ensure_exists(DB_URL, "127.0.0.1").await.expect("db_url");
    (store, client)
}

pub async fn next_event(stream: &mut WatchStream) -> WatchEvent {
    tokio::time::timeout(Duration::from_secs(3), stream.next())
        .await
        .expect("event in time")
        .expect("stream open")
}

/// Skips until a change carrying `value` arrives; panics on degraded notices
pub async fn change_with_value(
    stream: &mut WatchStream,
    value: &str,
) -> ConfigChangeEvent {
    loop {
        match next_event(stream).await {
            WatchEvent::Changed(change) if change.value.as_deref() == Some(value.as_bytes()) => return change,
            WatchEvent::Changed(_) => continue,
            other => panic!("unexpected event while waiting for {value}: {other:?}"),
        }
    }
}

/// Everything delivered within `window`
pub async fn drain(
    stream: &mut WatchStream,
    window: Duration,
) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, stream.next()).await {
        events.push(event);
    }
    events
}
