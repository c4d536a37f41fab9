//! Application-facing configuration client
//!
//! Wires the four components around one shared session:
//! - [`SessionManager`] - connection lifecycle and reconnects
//! - [`NodeRegistry`] - idempotent node bootstrap
//! - [`WatchEngine`] - self re-arming change streams
//! - [`ConfigWriter`] - optimistic versioned writes
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//!
//! use confwatch::ConfigClient;
//! use confwatch::MemStore;
//! use confwatch::Settings;
//! use confwatch::WatchEvent;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let client = ConfigClient::builder(Arc::new(MemStore::new()))
//!         .settings(Settings::default())
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     client.ensure_exists("/config", "").await.unwrap();
//!     client.ensure_exists("/config/db_url", "127.0.0.1").await.unwrap();
//!
//!     let _handle = client
//!         .watch_with("/config/db_url", |event| {
//!             if let WatchEvent::Changed(change) = event {
//!                 println!("db_url is now {:?}", change.value_str());
//!             }
//!         })
//!         .await
//!         .unwrap();
//!
//!     client.update("/config/db_url", "10.0.0.5").await.unwrap();
//!     client.shutdown().await;
//! }
//! ```

mod builder;
pub use builder::*;


use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ConfigNode;
use crate::ConfigWriter;
use crate::CoordinationStore;
use crate::NodeRegistry;
use crate::Result;
use crate::SessionManager;
use crate::WatchEngine;
use crate::WatchEvent;
use crate::WatchHandle;
use crate::WatchStream;

/// Main entry point for reading, watching and writing configuration
///
/// Created through the [`builder()`](ConfigClient::builder) method. Cloning shares the
/// same session and watch tasks.
#[derive(Debug, Clone)]
pub struct ConfigClient {
    pub(super) session: Arc<SessionManager>,
    pub(super) registry: NodeRegistry,
    pub(super) watcher: WatchEngine,
    pub(super) writer: ConfigWriter,
}

impl ConfigClient {
    /// Create a configured client builder over `store`
    pub fn builder(store: Arc<dyn CoordinationStore>) -> ConfigClientBuilder {
        ConfigClientBuilder::new(store)
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn watcher(&self) -> &WatchEngine {
        &self.watcher
    }

    pub fn writer(&self) -> &ConfigWriter {
        &self.writer
    }

    /// See [`NodeRegistry::ensure_exists`]
    pub async fn ensure_exists(
        &self,
        path: &str,
        default: impl Into<Bytes>,
    ) -> Result<ConfigNode> {
        self.registry.ensure_exists(path, default).await
    }

    /// See [`WatchEngine::watch`]
    pub async fn watch(
        &self,
        path: &str,
    ) -> Result<WatchStream> {
        self.watcher.watch(path).await
    }

    /// See [`WatchEngine::watch_with`]
    pub async fn watch_with<F>(
        &self,
        path: &str,
        callback: F,
    ) -> Result<WatchHandle>
    where
        F: FnMut(WatchEvent) + Send + 'static,
    {
        self.watcher.watch_with(path, callback).await
    }

    /// See [`ConfigWriter::update`]
    pub async fn update(
        &self,
        path: &str,
        value: impl Into<Bytes>,
    ) -> Result<ConfigNode> {
        self.writer.update(path, value).await
    }

    /// See [`ConfigWriter::update_with`]
    pub async fn update_with<F>(
        &self,
        path: &str,
        cancel: &CancellationToken,
        compute: F,
    ) -> Result<ConfigNode>
    where
        F: FnMut(&ConfigNode) -> Bytes,
    {
        self.writer.update_with(path, cancel, compute).await
    }

    /// Stops every watch, then closes the session.
    pub async fn shutdown(&self) {
        self.watcher.shutdown().await;
        self.session.stop().await;
        info!("config client shut down");
    }
}
