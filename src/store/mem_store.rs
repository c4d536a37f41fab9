use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::trace;

use super::CoordinationStore;
use super::NodeEvent;
use super::NodeEventKind;
use super::SessionId;
use super::Stat;
use super::StoreSessionEvent;
use crate::utils::path::parent_path;
use crate::utils::path::validate_path;
use crate::utils::time::get_now_as_millis;
use crate::ConnectionError;
use crate::Result;
use crate::StoreError;

const SESSION_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Live,
    /// Connection dropped, resumable until expired
    Disconnected,
}

#[derive(Debug, Clone)]
struct MemNode {
    data: Bytes,
    stat: Stat,
}

struct PendingWatch {
    session: SessionId,
    sender: oneshot::Sender<NodeEvent>,
}

struct MemStoreState {
    nodes: BTreeMap<String, MemNode>,
    zxid: u64,
    next_session: u64,
    sessions: HashMap<SessionId, SessionStatus>,
    watches: HashMap<String, Vec<PendingWatch>>,
    denied: HashSet<String>,
    available: bool,
}

/// In-process coordination store with ZooKeeper-like semantics
///
/// Nodes form a tree rooted at `/` (parents must exist before children), every node carries
/// a version bumped by each write, writes are always conditioned on that version and watches
/// are one-shot. Sessions can be dropped, resumed and expired on demand, which is what the
/// resilience tests and the demo binary need.
pub struct MemStore {
    state: Mutex<MemStoreState>,
    latency: Mutex<Duration>,
    events_tx: broadcast::Sender<StoreSessionEvent>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemStore")
            .field("nodes", &state.nodes.len())
            .field("sessions", &state.sessions.len())
            .field("zxid", &state.zxid)
            .finish_non_exhaustive()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(SESSION_EVENT_BUFFER);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            MemNode {
                data: Bytes::new(),
                stat: Stat::default(),
            },
        );
        Self {
            state: Mutex::new(MemStoreState {
                nodes,
                zxid: 0,
                next_session: 1,
                sessions: HashMap::new(),
                watches: HashMap::new(),
                denied: HashSet::new(),
                available: true,
            }),
            latency: Mutex::new(Duration::ZERO),
            events_tx,
        }
    }

    //------------------------------------------------------------------
    // Fault injection and out-of-band access

    /// While unavailable, `connect` is refused. Existing sessions are left alone; pair with
    /// [`disconnect_all`](Self::disconnect_all) to simulate an outage.
    pub fn set_available(
        &self,
        available: bool,
    ) {
        self.state.lock().available = available;
    }

    /// Adds a delay in front of every operation
    pub fn set_latency(
        &self,
        latency: Duration,
    ) {
        *self.latency.lock() = latency;
    }

    /// Drops the connection of every live session. Sessions stay resumable.
    pub fn disconnect_all(&self) {
        let (dropped, fired) = {
            let mut state = self.state.lock();
            let dropped: Vec<SessionId> = state
                .sessions
                .iter()
                .filter(|(_, status)| **status == SessionStatus::Live)
                .map(|(id, _)| *id)
                .collect();
            for id in &dropped {
                state.sessions.insert(*id, SessionStatus::Disconnected);
            }
            let fired = Self::take_session_watches(&mut state, &dropped);
            (dropped, fired)
        };

        Self::send_all(fired);
        for id in dropped {
            debug!(session = %id, "mem store dropped session connection");
            let _ = self.events_tx.send(StoreSessionEvent::Disconnected(id));
        }
    }

    /// Expires `session`; it can no longer be resumed.
    pub fn expire_session(
        &self,
        session: SessionId,
    ) {
        let fired = {
            let mut state = self.state.lock();
            if state.sessions.remove(&session).is_none() {
                return;
            }
            Self::take_session_watches(&mut state, &[session])
        };

        Self::send_all(fired);
        debug!(session = %session, "mem store expired session");
        let _ = self.events_tx.send(StoreSessionEvent::Expired(session));
    }

    /// Expires every known session
    pub fn expire_all(&self) {
        let sessions: Vec<SessionId> = self.state.lock().sessions.keys().copied().collect();
        for session in sessions {
            self.expire_session(session);
        }
    }

    /// Every later operation on `path` fails with `StoreError::NoAuth`
    pub fn deny(
        &self,
        path: &str,
    ) {
        self.state.lock().denied.insert(path.to_string());
    }

    pub fn allow(
        &self,
        path: &str,
    ) {
        self.state.lock().denied.remove(path);
    }

    /// Unconditional write by another actor. Creates the node (and its ancestors) if needed.
    pub fn external_set(
        &self,
        path: &str,
        value: impl Into<Bytes>,
    ) -> Result<Stat> {
        validate_path(path)?;
        let value = value.into();
        let (stat, fired) = {
            let mut state = self.state.lock();
            if !state.nodes.contains_key(path) {
                Self::create_ancestors(&mut state, path);
                let stat = Self::insert_node(&mut state, path, value);
                let fired = Self::take_path_watches(&mut state, path, NodeEventKind::Created);
                (stat, fired)
            } else {
                let stat = Self::write_node(&mut state, path, value);
                let fired = Self::take_path_watches(&mut state, path, NodeEventKind::DataChanged);
                (stat, fired)
            }
        };
        Self::send_all(fired);
        Ok(stat)
    }

    /// Removes `path` as another actor would.
    pub fn external_delete(
        &self,
        path: &str,
    ) -> Result<()> {
        let fired = {
            let mut state = self.state.lock();
            if state.nodes.remove(path).is_none() {
                return Err(StoreError::NoNode { path: path.to_string() }.into());
            }
            state.zxid += 1;
            Self::take_path_watches(&mut state, path, NodeEventKind::Deleted)
        };
        Self::send_all(fired);
        Ok(())
    }

    /// Current value and metadata of `path`
    pub fn node(
        &self,
        path: &str,
    ) -> Option<(Bytes, Stat)> {
        self.state.lock().nodes.get(path).map(|n| (n.data.clone(), n.stat))
    }

    /// Number of sessions not yet expired
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Number of armed watches on `path`
    pub fn watch_count(
        &self,
        path: &str,
    ) -> usize {
        self.state.lock().watches.get(path).map(|w| w.len()).unwrap_or(0)
    }

    //------------------------------------------------------------------
    // Internals

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_session(
        state: &MemStoreState,
        session: SessionId,
    ) -> Result<()> {
        match state.sessions.get(&session) {
            Some(SessionStatus::Live) => Ok(()),
            Some(SessionStatus::Disconnected) => Err(ConnectionError::ConnectionLoss.into()),
            None => Err(ConnectionError::SessionExpired(session).into()),
        }
    }

    fn check_access(
        state: &MemStoreState,
        path: &str,
    ) -> Result<()> {
        validate_path(path)?;
        if state.denied.contains(path) {
            return Err(StoreError::NoAuth { path: path.to_string() }.into());
        }
        Ok(())
    }

    fn insert_node(
        state: &mut MemStoreState,
        path: &str,
        value: Bytes,
    ) -> Stat {
        state.zxid += 1;
        let now = get_now_as_millis();
        let stat = Stat {
            version: 0,
            czxid: state.zxid,
            mzxid: state.zxid,
            ctime_ms: now,
            mtime_ms: now,
            data_length: value.len(),
        };
        state.nodes.insert(path.to_string(), MemNode { data: value, stat });
        stat
    }

    fn write_node(
        state: &mut MemStoreState,
        path: &str,
        value: Bytes,
    ) -> Stat {
        state.zxid += 1;
        let zxid = state.zxid;
        match state.nodes.get_mut(path) {
            Some(node) => {
                node.stat.version += 1;
                node.stat.mzxid = zxid;
                node.stat.mtime_ms = get_now_as_millis();
                node.stat.data_length = value.len();
                node.data = value;
                node.stat
            }
            None => Stat::default(),
        }
    }

    fn create_ancestors(
        state: &mut MemStoreState,
        path: &str,
    ) {
        for ancestor in crate::utils::path::ancestors(path) {
            if !state.nodes.contains_key(ancestor) {
                Self::insert_node(state, ancestor, Bytes::new());
            }
        }
    }

    fn take_path_watches(
        state: &mut MemStoreState,
        path: &str,
        kind: NodeEventKind,
    ) -> Vec<(oneshot::Sender<NodeEvent>, NodeEvent)> {
        state
            .watches
            .remove(path)
            .unwrap_or_default()
            .into_iter()
            .map(|w| {
                (
                    w.sender,
                    NodeEvent {
                        path: path.to_string(),
                        kind,
                    },
                )
            })
            .collect()
    }

    fn take_session_watches(
        state: &mut MemStoreState,
        sessions: &[SessionId],
    ) -> Vec<(oneshot::Sender<NodeEvent>, NodeEvent)> {
        let mut fired = Vec::new();
        for (path, pending) in state.watches.iter_mut() {
            let (lost, kept): (Vec<_>, Vec<_>) = pending.drain(..).partition(|w| sessions.contains(&w.session));
            *pending = kept;
            fired.extend(lost.into_iter().map(|w| {
                (
                    w.sender,
                    NodeEvent {
                        path: path.clone(),
                        kind: NodeEventKind::SessionLost,
                    },
                )
            }));
        }
        state.watches.retain(|_, pending| !pending.is_empty());
        fired
    }

    fn send_all(fired: Vec<(oneshot::Sender<NodeEvent>, NodeEvent)>) {
        for (sender, event) in fired {
            trace!(path = %event.path, kind = ?event.kind, "mem store watch fired");
            let _ = sender.send(event);
        }
    }
}

#[async_trait]
impl CoordinationStore for MemStore {
    async fn connect(
        &self,
        resume: Option<SessionId>,
    ) -> Result<SessionId> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if !state.available {
            return Err(ConnectionError::Refused("store unavailable".into()).into());
        }

        if let Some(id) = resume {
            return match state.sessions.get_mut(&id) {
                Some(status) => {
                    *status = SessionStatus::Live;
                    debug!(session = %id, "mem store resumed session");
                    Ok(id)
                }
                None => Err(ConnectionError::SessionExpired(id).into()),
            };
        }

        let id = SessionId(state.next_session);
        state.next_session += 1;
        state.sessions.insert(id, SessionStatus::Live);
        debug!(session = %id, "mem store opened session");
        Ok(id)
    }

    async fn close(
        &self,
        session: SessionId,
    ) -> Result<()> {
        let fired = {
            let mut state = self.state.lock();
            if state.sessions.remove(&session).is_none() {
                return Ok(());
            }
            Self::take_session_watches(&mut state, &[session])
        };
        Self::send_all(fired);
        Ok(())
    }

    async fn exists(
        &self,
        session: SessionId,
        path: &str,
    ) -> Result<Option<Stat>> {
        self.simulate_latency().await;
        let state = self.state.lock();
        Self::check_session(&state, session)?;
        Self::check_access(&state, path)?;
        Ok(state.nodes.get(path).map(|n| n.stat))
    }

    async fn create(
        &self,
        session: SessionId,
        path: &str,
        value: Bytes,
    ) -> Result<Stat> {
        self.simulate_latency().await;
        let (stat, fired) = {
            let mut state = self.state.lock();
            Self::check_session(&state, session)?;
            Self::check_access(&state, path)?;
            if state.nodes.contains_key(path) {
                return Err(StoreError::NodeExists { path: path.to_string() }.into());
            }
            if let Some(parent) = parent_path(path) {
                if !state.nodes.contains_key(parent) {
                    return Err(StoreError::NoNode {
                        path: parent.to_string(),
                    }
                    .into());
                }
            }
            let stat = Self::insert_node(&mut state, path, value);
            let fired = Self::take_path_watches(&mut state, path, NodeEventKind::Created);
            (stat, fired)
        };
        Self::send_all(fired);
        Ok(stat)
    }

    async fn get_data(
        &self,
        session: SessionId,
        path: &str,
    ) -> Result<(Bytes, Stat)> {
        self.simulate_latency().await;
        let state = self.state.lock();
        Self::check_session(&state, session)?;
        Self::check_access(&state, path)?;
        state
            .nodes
            .get(path)
            .map(|n| (n.data.clone(), n.stat))
            .ok_or_else(|| StoreError::NoNode { path: path.to_string() }.into())
    }

    async fn set_data(
        &self,
        session: SessionId,
        path: &str,
        value: Bytes,
        expected_version: u64,
    ) -> Result<Stat> {
        self.simulate_latency().await;
        let (stat, fired) = {
            let mut state = self.state.lock();
            Self::check_session(&state, session)?;
            Self::check_access(&state, path)?;
            let actual = match state.nodes.get(path) {
                Some(node) => node.stat.version,
                None => return Err(StoreError::NoNode { path: path.to_string() }.into()),
            };
            if actual != expected_version {
                return Err(StoreError::BadVersion {
                    path: path.to_string(),
                    expected: expected_version,
                    actual: Some(actual),
                }
                .into());
            }
            let stat = Self::write_node(&mut state, path, value);
            let fired = Self::take_path_watches(&mut state, path, NodeEventKind::DataChanged);
            (stat, fired)
        };
        Self::send_all(fired);
        Ok(stat)
    }

    async fn watch(
        &self,
        session: SessionId,
        path: &str,
    ) -> Result<oneshot::Receiver<NodeEvent>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        Self::check_session(&state, session)?;
        Self::check_access(&state, path)?;
        let (sender, receiver) = oneshot::channel();
        state
            .watches
            .entry(path.to_string())
            .or_default()
            .push(PendingWatch { session, sender });
        Ok(receiver)
    }

    fn session_events(&self) -> broadcast::Receiver<StoreSessionEvent> {
        self.events_tx.subscribe()
    }
}
