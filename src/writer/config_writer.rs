use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::utils::backoff::backoff_delay;
use crate::utils::backoff::sleep_or_cancel;
use crate::utils::backoff::with_timeout;
use crate::ConfigNode;
use crate::ConflictError;
use crate::Error;
use crate::Result;
use crate::SessionManager;
use crate::StoreError;
use crate::WriterConfig;

/// Applies updates conditioned on the version last read; never blind-overwrites.
#[derive(Debug, Clone)]
pub struct ConfigWriter {
    session: Arc<SessionManager>,
    config: WriterConfig,
}

impl ConfigWriter {
    pub fn new(
        session: Arc<SessionManager>,
        config: WriterConfig,
    ) -> Self {
        Self { session, config }
    }

    /// Replaces the value at `path`.
    ///
    /// # Errors
    /// - `ConflictError` when concurrent writers keep winning past `max_conflict_retries`
    /// - `StoreError::NoNode` if `path` does not exist
    /// - `Error::Connection` once the transient budget is spent
    pub async fn update(
        &self,
        path: &str,
        value: impl Into<Bytes>,
    ) -> Result<ConfigNode> {
        let value = value.into();
        self.write(path, &CancellationToken::new(), |_| value.clone(), true).await
    }

    /// Read-modify-write: `compute` receives the current node and returns the value to write.
    ///
    /// `compute` runs again after every conflict and every transient failure, against the
    /// fresh read. `cancel` is honoured after each store round trip; a write already accepted
    /// by the store is reported as done.
    ///
    /// A write that timed out may still have been applied; the retry then applies `compute`
    /// on top of it, so `compute` should tolerate running against its own result.
    pub async fn update_with<F>(
        &self,
        path: &str,
        cancel: &CancellationToken,
        compute: F,
    ) -> Result<ConfigNode>
    where
        F: FnMut(&ConfigNode) -> Bytes,
    {
        self.write(path, cancel, compute, false).await
    }

    /// `idempotent` marks a constant target value: finding it stored after a write of unknown
    /// outcome means the write is done.
    async fn write<F>(
        &self,
        path: &str,
        cancel: &CancellationToken,
        mut compute: F,
        idempotent: bool,
    ) -> Result<ConfigNode>
    where
        F: FnMut(&ConfigNode) -> Bytes,
    {
        let mut conflicts = 0usize;
        let mut transient_failures = 0usize;
        // value of a write whose outcome we never learned; only kept when `idempotent`
        let mut ambiguous: Option<Bytes> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(path));
            }

            let attempt = self.attempt(path, cancel, &mut compute, &mut ambiguous, idempotent).await;

            let delay = match attempt {
                Ok(Attempt::Written(node)) => {
                    info!(path, version = node.version, "configuration updated");
                    return Ok(node);
                }
                Ok(Attempt::Conflict(seen_version)) => {
                    conflicts += 1;
                    if conflicts > self.config.max_conflict_retries {
                        warn!(path, conflicts, "update lost every conflict");
                        return Err(ConflictError {
                            path: path.to_string(),
                            attempts: conflicts,
                            last_seen_version: seen_version,
                        }
                        .into());
                    }
                    debug!(path, conflicts, seen_version, "version conflict, re-reading");
                    backoff_delay(&self.config.conflict_backoff, conflicts)
                }
                Err(e) if e.is_transient() => {
                    transient_failures += 1;
                    if self.config.transient.exhausted(transient_failures) {
                        warn!(path, transient_failures, "update giving up: {}", e);
                        return Err(e);
                    }
                    debug!(path, transient_failures, "update retrying: {}", e);
                    backoff_delay(&self.config.transient, transient_failures)
                }
                Err(e) => return Err(e),
            };

            if !sleep_or_cancel(delay, cancel).await {
                return Err(cancelled(path));
            }
        }
    }

    /// One read plus one conditioned write
    async fn attempt<F>(
        &self,
        path: &str,
        cancel: &CancellationToken,
        compute: &mut F,
        ambiguous: &mut Option<Bytes>,
        idempotent: bool,
    ) -> Result<Attempt>
    where
        F: FnMut(&ConfigNode) -> Bytes,
    {
        let timeout = self.session.config().request_timeout();
        let session = self.session.ensure_connected().await?;
        let id = session.live_id()?;

        let (current, stat) = with_timeout("get_data", timeout, self.session.store().get_data(id, path)).await?;
        self.session.observe(&stat);
        let node = ConfigNode::from_stat(path, current, &stat);
        if cancel.is_cancelled() {
            return Err(cancelled(path));
        }
        if let Some(pending) = ambiguous.take() {
            if pending == node.value {
                debug!(path, version = node.version, "earlier write landed");
                return Ok(Attempt::Written(node));
            }
        }

        let next = compute(&node);
        let written = with_timeout(
            "set_data",
            timeout,
            self.session.store().set_data(id, path, next.clone(), node.version),
        )
        .await;
        match written {
            Ok(stat) => {
                self.session.observe(&stat);
                Ok(Attempt::Written(ConfigNode::from_stat(path, next, &stat)))
            }
            Err(Error::Store(StoreError::BadVersion { actual, .. })) => {
                Ok(Attempt::Conflict(actual.unwrap_or(node.version)))
            }
            Err(e) => {
                if idempotent && e.is_transient() {
                    *ambiguous = Some(next);
                }
                Err(e)
            }
        }
    }
}

enum Attempt {
    Written(ConfigNode),
    /// Version that beat us, or the one we conditioned on if the store did not say
    Conflict(u64),
}

fn cancelled(path: &str) -> Error {
    Error::Cancelled { path: path.to_string() }
}
