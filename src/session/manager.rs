use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::LifecycleEvent;
use super::Session;
use super::SessionState;
use crate::utils::backoff::jittered_delay;
use crate::utils::backoff::sleep_or_cancel;
use crate::utils::backoff::with_timeout;
use crate::ConnectionError;
use crate::CoordinationStore;
use crate::Error;
use crate::Result;
use crate::SessionConfig;
use crate::SessionId;
use crate::Stat;
use crate::StoreSessionEvent;

type StateCallback = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Owns the connection/session lifecycle to the coordination store
///
/// - [`start`](Self::start) spawns the reconnect loop: connect, wait for loss, back off, retry
/// - [`ensure_connected`](Self::ensure_connected) suspends callers until a session is live
/// - [`subscribe`](Self::subscribe) / [`on_state_change`](Self::on_state_change) deliver
///   [`LifecycleEvent`]s
///
/// A dropped connection is resumed with the same session id when the store still knows it;
/// after expiry a fresh session is opened and every watch has to be re-registered.
pub struct SessionManager {
    store: Arc<dyn CoordinationStore>,
    config: SessionConfig,

    /// Current session snapshot, replaced on every transition
    current: ArcSwap<Session>,

    /// Wakes `ensure_connected` waiters
    state_tx: watch::Sender<SessionState>,

    events_tx: broadcast::Sender<LifecycleEvent>,
    callbacks: RwLock<Vec<StateCallback>>,

    /// Serializes connect attempts
    connect_lock: tokio::sync::Mutex<()>,

    shutdown: CancellationToken,
    closed: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("current", &self.current.load())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (events_tx, _) = broadcast::channel(config.event_buffer_size.max(1));
        Arc::new(Self {
            store,
            config,
            current: ArcSwap::from_pointee(Session::initial()),
            state_tx,
            events_tx,
            callbacks: RwLock::new(Vec::new()),
            connect_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Latest session snapshot. Do not keep it across a suspension point.
    pub fn current(&self) -> Arc<Session> {
        self.current.load_full()
    }

    pub fn state(&self) -> SessionState {
        self.current.load().state
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Receives every lifecycle event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events_tx.subscribe()
    }

    /// Registers a callback invoked synchronously on every lifecycle event
    pub fn on_state_change<F>(
        &self,
        callback: F,
    ) where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Starts the background reconnect loop.
    ///
    /// Calling `start()` when the loop is already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle_guard = self.handle.lock();
        if handle_guard.is_some() || self.is_closed() {
            return;
        }

        let this = Arc::clone(self);
        *handle_guard = Some(tokio::spawn(async move {
            debug!("session loop started");
            this.run().await;
            debug!("session loop stopped");
        }));
    }

    /// Stops the reconnect loop and closes the store session.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("session loop ended abnormally: {:?}", e);
            }
        }
        self.closed.store(true, Ordering::Release);

        let session = self.current();
        if let Some(id) = session.id {
            let closing = with_timeout("close", self.config.request_timeout(), self.store.close(id)).await;
            if let Err(e) = closing {
                warn!(session = %id, "closing session failed: {}", e);
            }
        }
        let was_connected = session.is_connected();
        self.publish(Session {
            id: None,
            state: SessionState::Disconnected,
            ..(*session).clone()
        });
        if was_connected {
            self.emit(LifecycleEvent::Disconnected { session_id: session.id });
        }
        info!("session manager stopped");
    }

    /// Waits for a connected session, up to the configured deadline.
    pub async fn ensure_connected(&self) -> Result<Arc<Session>> {
        self.ensure_connected_within(self.config.ensure_connected_timeout()).await
    }

    /// Waits for a connected session, up to `deadline`.
    ///
    /// # Errors
    /// - `ConnectionError::NotConnected` when the deadline elapses
    /// - `ConnectionError::Closed` once the manager is stopped or gave up
    pub async fn ensure_connected_within(
        &self,
        deadline: Duration,
    ) -> Result<Arc<Session>> {
        let mut state_rx = self.state_tx.subscribe();
        let wait = async {
            loop {
                let session = self.current();
                if session.is_connected() {
                    return Ok(session);
                }
                if self.is_closed() {
                    return Err(ConnectionError::Closed);
                }
                if state_rx.changed().await.is_err() {
                    return Err(ConnectionError::Closed);
                }
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(ConnectionError::NotConnected(deadline).into()),
        }
    }

    /// Performs one connect attempt bounded by `connect_timeout_ms`.
    ///
    /// Resumes the previous session unless it expired. A resume refused because the session
    /// expired transitions to [`SessionState::Expired`] and returns
    /// `ConnectionError::SessionExpired`; the next attempt opens a fresh session.
    pub async fn connect(&self) -> std::result::Result<Arc<Session>, ConnectionError> {
        let _guard = self.connect_lock.lock().await;
        if self.shutdown.is_cancelled() || self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let previous = self.current();
        if previous.is_connected() {
            return Ok(previous);
        }
        let resume = previous.id;
        self.publish(Session {
            state: SessionState::Connecting,
            ..(*previous).clone()
        });

        let attempt = with_timeout("connect", self.config.connect_timeout(), self.store.connect(resume)).await;
        match attempt {
            Ok(id) => {
                let resumed = resume == Some(id);
                let generation = if resumed {
                    previous.generation
                } else {
                    previous.generation + 1
                };
                let session = Session {
                    id: Some(id),
                    state: SessionState::Connected,
                    generation,
                    last_zxid: previous.last_zxid,
                };
                self.publish(session);
                info!(session = %id, generation, resumed, "connected to coordination store");
                self.emit(LifecycleEvent::Connected {
                    session_id: id,
                    generation,
                    resumed,
                });
                Ok(self.current())
            }
            Err(Error::Connection(ConnectionError::SessionExpired(id))) => {
                self.mark_expired(id);
                Err(ConnectionError::SessionExpired(id))
            }
            Err(e) => {
                self.publish(Session {
                    state: SessionState::Disconnected,
                    ..(*previous).clone()
                });
                match e {
                    Error::Connection(e) => Err(e),
                    other => Err(ConnectionError::Refused(other.to_string())),
                }
            }
        }
    }

    /// Advances the last-seen modification sequence
    pub fn observe(
        &self,
        stat: &Stat,
    ) {
        if self.current.load().last_zxid >= stat.mzxid {
            return;
        }
        self.current.rcu(|session| {
            let mut next = (**session).clone();
            next.last_zxid = next.last_zxid.max(stat.mzxid);
            next
        });
    }

    //------------------------------------------------------------------
    // Reconnect loop

    async fn run(self: Arc<Self>) {
        let mut store_events = self.store.session_events();
        let policy = self.config.reconnect;
        let mut failures = 0usize;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.connect().await {
                Ok(session) => {
                    failures = 0;
                    let Some(id) = session.id else { continue };
                    if !self.wait_for_session_loss(&mut store_events, id).await {
                        break;
                    }
                }
                // fresh session right away
                Err(ConnectionError::SessionExpired(_)) => continue,
                Err(ConnectionError::Closed) => break,
                Err(e) => {
                    failures += 1;
                    if policy.exhausted(failures) {
                        error!(failures, "giving up reconnecting: {}", e);
                        self.closed.store(true, Ordering::Release);
                        self.state_tx.send_replace(SessionState::Disconnected);
                        break;
                    }
                    let delay = jittered_delay(&policy, failures, self.config.jitter);
                    warn!(failures, ?delay, "connect failed: {}", e);
                    if !sleep_or_cancel(delay, &self.shutdown).await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns false on shutdown, true once the session is lost.
    async fn wait_for_session_loss(
        &self,
        store_events: &mut broadcast::Receiver<StoreSessionEvent>,
        id: SessionId,
    ) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                event = store_events.recv() => match event {
                    Ok(StoreSessionEvent::Disconnected(lost)) if lost == id => {
                        self.mark_disconnected(id);
                        return true;
                    }
                    Ok(StoreSessionEvent::Expired(lost)) if lost == id => {
                        self.mark_expired(id);
                        return true;
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session events lagged, probing session");
                        if !self.probe(id).await {
                            return true;
                        }
                    }
                    Err(RecvError::Closed) => {
                        self.mark_disconnected(id);
                        return true;
                    }
                }
            }
        }
    }

    /// Checks whether `id` is still usable; marks the loss otherwise.
    async fn probe(
        &self,
        id: SessionId,
    ) -> bool {
        match with_timeout("exists", self.config.request_timeout(), self.store.exists(id, "/")).await {
            Ok(_) => true,
            Err(Error::Connection(ConnectionError::SessionExpired(_))) => {
                self.mark_expired(id);
                false
            }
            Err(e) if e.is_transient() => {
                self.mark_disconnected(id);
                false
            }
            Err(_) => true,
        }
    }

    fn mark_disconnected(
        &self,
        id: SessionId,
    ) {
        let previous = self.current();
        self.publish(Session {
            state: SessionState::Disconnected,
            ..(*previous).clone()
        });
        warn!(session = %id, "connection to coordination store lost");
        self.emit(LifecycleEvent::Disconnected { session_id: Some(id) });
    }

    fn mark_expired(
        &self,
        id: SessionId,
    ) {
        let previous = self.current();
        self.publish(Session {
            id: None,
            state: SessionState::Expired,
            ..(*previous).clone()
        });
        warn!(session = %id, "session expired, watches must be re-registered");
        self.emit(LifecycleEvent::Expired { session_id: id });
    }

    /// Swaps the snapshot first so woken waiters observe it.
    fn publish(
        &self,
        session: Session,
    ) {
        let state = session.state;
        self.current.store(Arc::new(session));
        self.state_tx.send_replace(state);
    }

    fn emit(
        &self,
        event: LifecycleEvent,
    ) {
        let callbacks: Vec<StateCallback> = self.callbacks.read().clone();
        for callback in callbacks {
            callback(&event);
        }
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }
}
