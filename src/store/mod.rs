//! Coordination store boundary
//!
//! The wire protocol of the coordination service is not implemented here. Everything the
//! client needs from it is captured by [`CoordinationStore`]: session establishment, the
//! five node operations and one-shot watches. [`MemStore`] is an in-process implementation
//! used by the demo binary and the test suite.

mod mem_store;
pub use mem_store::*;


use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::oneshot;

use crate::Result;

/// Identifier of a store-side session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Node metadata returned with every read and write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Data version, 0 on creation and +1 per write
    pub version: u64,
    /// Store-wide sequence number of the create
    pub czxid: u64,
    /// Store-wide sequence number of the last modification
    pub mzxid: u64,
    pub ctime_ms: u64,
    pub mtime_ms: u64,
    pub data_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Created,
    DataChanged,
    Deleted,
    /// The owning session disconnected or expired before the node changed
    SessionLost,
}

/// Payload of a fired one-shot watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub path: String,
    pub kind: NodeEventKind,
}

/// Session-level notifications pushed by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSessionEvent {
    /// Connection dropped; the session can be resumed until it expires
    Disconnected(SessionId),
    /// Session is gone; its watches will never fire
    Expired(SessionId),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Opens a session, or resumes `resume` if it is still alive.
    ///
    /// # Errors
    /// - `ConnectionError::SessionExpired` when `resume` names a dead session
    /// - `ConnectionError::Refused` / `ConnectionLoss` when the store is unreachable
    async fn connect(
        &self,
        resume: Option<SessionId>,
    ) -> Result<SessionId>;

    /// Ends a session. Closing an unknown session is not an error.
    async fn close(
        &self,
        session: SessionId,
    ) -> Result<()>;

    async fn exists(
        &self,
        session: SessionId,
        path: &str,
    ) -> Result<Option<Stat>>;

    /// Creates `path` with `value` at version 0.
    ///
    /// # Errors
    /// - `StoreError::NodeExists` if the node is already present
    /// - `StoreError::NoNode` if the parent is missing
    async fn create(
        &self,
        session: SessionId,
        path: &str,
        value: Bytes,
    ) -> Result<Stat>;

    async fn get_data(
        &self,
        session: SessionId,
        path: &str,
    ) -> Result<(Bytes, Stat)>;

    /// Writes `value` only if the node is still at `expected_version`.
    ///
    /// # Errors
    /// - `StoreError::BadVersion` on a version mismatch
    async fn set_data(
        &self,
        session: SessionId,
        path: &str,
        value: Bytes,
        expected_version: u64,
    ) -> Result<Stat>;

    /// Registers a one-shot watch on `path`, which does not need to exist yet.
    ///
    /// The receiver resolves once, on the next create/change/delete of `path`, or with
    /// [`NodeEventKind::SessionLost`] when `session` disconnects or expires first.
    async fn watch(
        &self,
        session: SessionId,
        path: &str,
    ) -> Result<oneshot::Receiver<NodeEvent>>;

    fn session_events(&self) -> broadcast::Receiver<StoreSessionEvent>;
}
