use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::ConfigClient;
use crate::ConfigWriter;
use crate::CoordinationStore;
use crate::NodeRegistry;
use crate::RegistryConfig;
use crate::Result;
use crate::SessionConfig;
use crate::SessionManager;
use crate::Settings;
use crate::WatchConfig;
use crate::WatchEngine;
use crate::WriterConfig;

pub struct ConfigClientBuilder {
    store: Arc<dyn CoordinationStore>,
    settings: Settings,
    wait_connected: bool,
}

impl ConfigClientBuilder {
    /// Create a new builder with default settings over `store`
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            settings: Settings::default(),
            wait_connected: true,
        }
    }

    /// Completely replaces the current settings
    ///
    /// Discards anything set earlier through the per-section methods.
    pub fn settings(
        mut self,
        settings: Settings,
    ) -> Self {
        self.settings = settings;
        self
    }

    pub fn session_config(
        mut self,
        config: SessionConfig,
    ) -> Self {
        self.settings.session = config;
        self
    }

    pub fn registry_config(
        mut self,
        config: RegistryConfig,
    ) -> Self {
        self.settings.registry = config;
        self
    }

    pub fn watch_config(
        mut self,
        config: WatchConfig,
    ) -> Self {
        self.settings.watch = config;
        self
    }

    pub fn writer_config(
        mut self,
        config: WriterConfig,
    ) -> Self {
        self.settings.writer = config;
        self
    }

    /// Set the per-round-trip deadline (default: 1s)
    pub fn request_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.settings.session.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Whether `build()` waits for the first session (default: true)
    ///
    /// When disabled the client is returned immediately and the session is established
    /// in the background; every operation waits for it on its own.
    pub fn wait_connected(
        mut self,
        wait: bool,
    ) -> Self {
        self.wait_connected = wait;
        self
    }

    /// Validates the settings, starts the session and wires the components.
    ///
    /// # Errors
    /// - `Error::Config` for invalid settings
    /// - `ConnectionError::NotConnected` if the store is unreachable within
    ///   `ensure_connected_timeout_ms` (only when waiting)
    pub async fn build(self) -> Result<ConfigClient> {
        let settings = self.settings.validate()?;

        let session = SessionManager::new(self.store, settings.session);
        session.start();
        if self.wait_connected {
            if let Err(e) = session.ensure_connected().await {
                session.stop().await;
                return Err(e);
            }
        }
        debug!("config client ready");

        Ok(ConfigClient {
            registry: NodeRegistry::new(session.clone(), settings.registry),
            watcher: WatchEngine::new(session.clone(), settings.watch),
            writer: ConfigWriter::new(session.clone(), settings.writer),
            session,
        })
    }
}
