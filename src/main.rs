use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use confwatch::ConfigClient;
use confwatch::MemStore;
use confwatch::Result;
use confwatch::Settings;
use confwatch::WatchEvent;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let settings = Settings::new()?.validate()?;

    // Initializing Logs
    init_observability();

    // Initializing Shutdown Signal
    let shutdown = CancellationToken::new();

    // The coordination service runs embedded; `store_address` is informational only.
    info!(store = %settings.app.store_address, "starting configuration watcher");
    let store = Arc::new(MemStore::new());
    let client = ConfigClient::builder(store).settings(settings.clone()).build().await?;

    let app = &settings.app;
    client.ensure_exists(&app.base_path, Bytes::new()).await?;

    let mut handles = Vec::new();
    let mut paths = Vec::new();
    for (key, default) in &app.keys {
        let path = app.key_path(key);
        let node = client.ensure_exists(&path, default.clone()).await?;
        info!(path = %path, value = %node.value_str(), version = node.version, "configuration ready");

        let handle = client
            .watch_with(&path, |event| match event {
                WatchEvent::Changed(change) => info!(
                    path = %change.path,
                    value = ?change.value_str(),
                    version = ?change.version,
                    "configuration changed"
                ),
                WatchEvent::Degraded { path, attempts, reason, .. } => {
                    warn!(path = %path, attempts, reason = %reason, "watch degraded")
                }
                WatchEvent::Restored { path } => info!(path = %path, "watch restored"),
            })
            .await?;
        handles.push(handle);
        paths.push(path);
    }

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = graceful_shutdown(shutdown).await {
                error!("Failed to shutdown: {:?}", e);
            }
        }
    });

    info!("Application started. Waiting for CTRL+C signal...");
    match app.update_interval() {
        Some(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for path in &paths {
                            let value = format!("{}{}", app.value_prefix, rand::random::<f64>());
                            if let Err(e) = client.update(path, value).await {
                                warn!(path = %path, "periodic update failed: {}", e);
                            }
                        }
                    }
                }
            }
        }
        None => {
            info!("periodic writer disabled, only watching");
            shutdown.cancelled().await;
        }
    }

    for handle in &handles {
        handle.stop().await;
    }
    client.shutdown().await;
    println!("Exiting program.");
    Ok(())
}

async fn graceful_shutdown(shutdown: CancellationToken) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }

    shutdown.cancel();
    info!("Shutdown completed");
    Ok(())
}

fn init_observability() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
