//! Configuration-watch client error hierarchy
//!
//! Errors are split by how far they are allowed to travel:
//! - [`ConnectionError`] is transient and absorbed by the session reconnect loop and by the
//!   per-operation retry loops built on top of it.
//! - [`StoreError`] is a node-level failure returned to the caller of the operation.
//! - [`ConflictError`] is an optimistic-write collision that outlived the retry budget.
//!
//! Degraded watches are not errors: they travel as [`crate::WatchEvent::Degraded`].

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

use crate::SessionId;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Session or transport failures (retryable)
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Node-level failures reported by the coordination store
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Optimistic-write collisions exceeding the retry budget
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Operation abandoned through its cancellation token
    #[error("Operation on {path} cancelled")]
    Cancelled { path: String },

    /// Background task panicked or was aborted
    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// A single store round trip exceeded its deadline
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: &'static str,
        duration: Duration,
    },

    /// No connected session within the caller's deadline
    #[error("No connected session after {0:?}")]
    NotConnected(Duration),

    /// The connection dropped; the session may still be resumable
    #[error("Connection to coordination store lost")]
    ConnectionLoss,

    /// The session is gone for good; a fresh one is required
    #[error("Session {0} expired")]
    SessionExpired(SessionId),

    /// The store refused the connection attempt
    #[error("Connection refused: {0}")]
    Refused(String),

    /// The session manager has been stopped or gave up reconnecting
    #[error("Session manager closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Node required by the operation does not exist
    #[error("Node {path} does not exist")]
    NoNode { path: String },

    /// Node already exists (benign for ensure-exists)
    #[error("Node {path} already exists")]
    NodeExists { path: String },

    /// Conditioned write saw a different version
    #[error("Version mismatch on {path}: expected {expected}, found {actual:?}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: Option<u64>,
    },

    /// Caller is not authorised for the node
    #[error("Not authorized to access {path}")]
    NoAuth { path: String },

    /// Path is not a well-formed absolute node path
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

/// Optimistic-write collision that survived every retry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Write to {path} conflicted {attempts} times (last seen version {last_seen_version})")]
pub struct ConflictError {
    pub path: String,
    /// Conflicting attempts, the first one included
    pub attempts: usize,
    /// Version of the write that beat the last attempt
    pub last_seen_version: u64,
}

impl Error {
    /// Transient failures are retried locally; everything else goes to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connection(
                ConnectionError::Timeout { .. }
                    | ConnectionError::NotConnected(_)
                    | ConnectionError::ConnectionLoss
                    | ConnectionError::SessionExpired(_)
                    | ConnectionError::Refused(_)
            )
        )
    }

    /// Failures that no amount of retrying will fix
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::Store(StoreError::NoAuth { .. } | StoreError::InvalidPath { .. })
                | Error::Connection(ConnectionError::Closed)
                | Error::Config(_)
                | Error::Fatal(_)
        )
    }
}
