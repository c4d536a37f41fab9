use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ConfigNode;
use crate::utils::backoff::backoff_delay;
use crate::utils::backoff::with_timeout;
use crate::utils::path::ancestors;
use crate::utils::path::validate_path;
use crate::Error;
use crate::RegistryConfig;
use crate::Result;
use crate::SessionId;
use crate::SessionManager;
use crate::StoreError;

/// A node deleted between our `exists` and `get_data`, or a parent removed between
/// creating it and the child, restarts the round.
const MAX_ENSURE_ROUNDS: usize = 8;

/// Idempotent creation of configuration nodes
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    session: Arc<SessionManager>,
    config: RegistryConfig,
}

impl NodeRegistry {
    pub fn new(
        session: Arc<SessionManager>,
        config: RegistryConfig,
    ) -> Self {
        Self { session, config }
    }

    /// Makes sure `path` exists, creating it with `default` if it does not.
    ///
    /// An existing node is returned unchanged. Losing a creation race to another actor
    /// counts as success and returns the winner's value.
    ///
    /// # Errors
    /// - `StoreError::InvalidPath` / `StoreError::NoAuth` immediately
    /// - `StoreError::NoNode` for a missing parent when `create_parents` is off
    /// - the last `Error::Connection` once the retry budget is spent
    pub async fn ensure_exists(
        &self,
        path: &str,
        default: impl Into<Bytes>,
    ) -> Result<ConfigNode> {
        validate_path(path)?;
        let default = default.into();
        let policy = self.config.retry;

        let mut failures = 0usize;
        loop {
            match self.try_ensure(path, &default).await {
                Ok(node) => return Ok(node),
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if policy.exhausted(failures) {
                        warn!(path, failures, "ensure_exists giving up: {}", e);
                        return Err(e);
                    }
                    let delay = backoff_delay(&policy, failures);
                    debug!(path, failures, ?delay, "ensure_exists retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Applies [`ensure_exists`](Self::ensure_exists) to every entry in order.
    pub async fn ensure_all<P, V>(
        &self,
        entries: impl IntoIterator<Item = (P, V)>,
    ) -> Result<Vec<ConfigNode>>
    where
        P: AsRef<str>,
        V: Into<Bytes>,
    {
        let mut nodes = Vec::new();
        for (path, default) in entries {
            nodes.push(self.ensure_exists(path.as_ref(), default).await?);
        }
        Ok(nodes)
    }

    async fn try_ensure(
        &self,
        path: &str,
        default: &Bytes,
    ) -> Result<ConfigNode> {
        let session = self.session.ensure_connected().await?;
        let id = session.live_id()?;

        for _ in 0..MAX_ENSURE_ROUNDS {
            if self.exists(id, path).await? {
                match self.read(id, path).await {
                    Ok(node) => return Ok(node),
                    Err(Error::Store(StoreError::NoNode { .. })) => continue,
                    Err(e) => return Err(e),
                }
            }

            let timeout = self.session.config().request_timeout();
            let created = with_timeout("create", timeout, self.session.store().create(id, path, default.clone())).await;
            match created {
                Ok(stat) => {
                    self.session.observe(&stat);
                    info!(path, version = stat.version, "created configuration node");
                    return Ok(ConfigNode::from_stat(path, default.clone(), &stat));
                }
                Err(Error::Store(StoreError::NodeExists { .. })) => {
                    debug!(path, "node created concurrently, reading winner");
                    match self.read(id, path).await {
                        Ok(node) => return Ok(node),
                        Err(Error::Store(StoreError::NoNode { .. })) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(Error::Store(StoreError::NoNode { .. })) if self.config.create_parents => {
                    self.ensure_ancestors(id, path).await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Fatal(format!(
            "{path} kept changing under ensure_exists after {MAX_ENSURE_ROUNDS} rounds"
        )))
    }

    async fn ensure_ancestors(
        &self,
        id: SessionId,
        path: &str,
    ) -> Result<()> {
        let timeout = self.session.config().request_timeout();
        for ancestor in ancestors(path) {
            if self.exists(id, ancestor).await? {
                continue;
            }
            match with_timeout("create", timeout, self.session.store().create(id, ancestor, Bytes::new())).await {
                Ok(stat) => {
                    self.session.observe(&stat);
                    debug!(path = ancestor, "created parent node");
                }
                Err(Error::Store(StoreError::NodeExists { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn exists(
        &self,
        id: SessionId,
        path: &str,
    ) -> Result<bool> {
        let timeout = self.session.config().request_timeout();
        let stat = with_timeout("exists", timeout, self.session.store().exists(id, path)).await?;
        Ok(stat.is_some())
    }

    async fn read(
        &self,
        id: SessionId,
        path: &str,
    ) -> Result<ConfigNode> {
        let timeout = self.session.config().request_timeout();
        let (value, stat) = with_timeout("get_data", timeout, self.session.store().get_data(id, path)).await?;
        self.session.observe(&stat);
        Ok(ConfigNode::from_stat(path, value, &stat))
    }
}
