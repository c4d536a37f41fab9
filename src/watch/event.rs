use bytes::Bytes;

/// Why a change event was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// The store fired the armed watch
    Notification,
    /// Fresh read after the session dropped or expired
    Reconciliation,
}

/// A configuration value changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChangeEvent {
    pub path: String,
    /// `None` when the node no longer exists
    pub value: Option<Bytes>,
    /// `None` when the node no longer exists
    pub version: Option<u64>,
    /// Local wall clock at delivery
    pub timestamp_ms: u64,
    pub source: ChangeSource,
}

impl ConfigChangeEvent {
    pub fn value_str(&self) -> Option<std::borrow::Cow<'_, str>> {
        self.value.as_ref().map(|v| String::from_utf8_lossy(v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Changed(ConfigChangeEvent),

    /// Re-arming failed `attempts` times in a row. Updates may be missed until
    /// [`WatchEvent::Restored`]; a `permanent` degradation ends the stream.
    Degraded {
        path: String,
        attempts: usize,
        reason: String,
        permanent: bool,
    },

    Restored {
        path: String,
    },
}

impl WatchEvent {
    pub fn path(&self) -> &str {
        match self {
            WatchEvent::Changed(change) => &change.path,
            WatchEvent::Degraded { path, .. } | WatchEvent::Restored { path } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    AwaitingSession,
    Arming,
    Armed,
    Fired,
    Degraded,
    Cancelled,
}

/// Point-in-time view of one watched path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchStatus {
    pub path: String,
    pub phase: WatchPhase,
    pub armed: bool,
    /// `None` before the first read and while the node is absent
    pub last_delivered_version: Option<u64>,
    pub rearm_failures: usize,
    pub subscribers: usize,
}
