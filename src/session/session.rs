use crate::ConnectionError;
use crate::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Expired,
}

/// Snapshot of the live connection to the coordination store
///
/// Published by the [`crate::SessionManager`]; a new snapshot replaces this one on every
/// transition, so a held `Session` is only a point-in-time view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Store-side session id; `None` before the first connect and after expiry
    pub id: Option<SessionId>,
    pub state: SessionState,
    /// Number of distinct store sessions established so far (resumes do not count)
    pub generation: u64,
    /// Highest modification sequence observed through this client
    pub last_zxid: u64,
}

impl Session {
    pub(crate) fn initial() -> Self {
        Self {
            id: None,
            state: SessionState::Disconnected,
            generation: 0,
            last_zxid: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected && self.id.is_some()
    }

    /// Id of a connected session, for use in a store round trip
    pub fn live_id(&self) -> std::result::Result<SessionId, ConnectionError> {
        match (self.state, self.id) {
            (SessionState::Connected, Some(id)) => Ok(id),
            _ => Err(ConnectionError::ConnectionLoss),
        }
    }
}

/// Lifecycle notifications broadcast to the watch engine, the writer and the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected {
        session_id: SessionId,
        generation: u64,
        /// The previous session survived the outage
        resumed: bool,
    },
    Disconnected {
        session_id: Option<SessionId>,
    },
    Expired {
        session_id: SessionId,
    },
}
