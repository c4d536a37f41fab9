use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::ChangeSource;
use super::ConfigChangeEvent;
use super::WatchEvent;
use super::WatchHandle;
use super::WatchPhase;
use super::WatchStatus;
use super::WatchStream;
use crate::utils::backoff::backoff_delay;
use crate::utils::backoff::sleep_or_cancel;
use crate::utils::backoff::with_timeout;
use crate::utils::path::validate_path;
use crate::utils::time::get_now_as_millis;
use crate::ConfigNode;
use crate::ConnectionError;
use crate::Error;
use crate::LifecycleEvent;
use crate::NodeEvent;
use crate::NodeEventKind;
use crate::Result;
use crate::Session;
use crate::SessionId;
use crate::SessionManager;
use crate::StoreError;
use crate::WatchConfig;

/// Registers self re-arming watches and fans their events out to subscribers
///
/// Cloning is cheap; clones share the same per-path tasks.
#[derive(Debug, Clone)]
pub struct WatchEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    session: Arc<SessionManager>,
    config: WatchConfig,

    /// One entry per watched path; removed when its last subscriber leaves
    watches: DashMap<String, Arc<PathWatch>>,

    next_subscriber_id: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for EngineInner {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EngineInner")
            .field("watches", &self.watches.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Outcome of the first arm+read, awaited by [`WatchEngine::watch`]
#[derive(Debug, Clone)]
enum Readiness {
    Pending,
    Ready(ConfigNode),
    Failed(StoreError),
    Closed,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
}

struct PathState {
    subscribers: Vec<Subscriber>,
    /// `None` until the first successful read seeds it
    last_delivered: Option<ConfigNode>,
    phase: WatchPhase,
    armed: bool,
    rearm_failures: usize,
}

/// Shared state of one watched path, owned by its dispatch task
pub(crate) struct PathWatch {
    path: String,
    state: Mutex<PathState>,
    cancel: CancellationToken,
    ready_tx: watch::Sender<Readiness>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WatchEngine {
    pub fn new(
        session: Arc<SessionManager>,
        config: WatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                session,
                config,
                watches: DashMap::new(),
                next_subscriber_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Subscribes to `path`.
    ///
    /// Returns once the store watch is armed and the current value read; that value is
    /// available through [`WatchStream::initial`] and is not emitted as an event. The path
    /// need not exist yet.
    ///
    /// # Errors
    /// - `StoreError::InvalidPath` / `StoreError::NoAuth`
    /// - `ConnectionError::NotConnected` if the first arm does not succeed within the
    ///   session's ensure-connected deadline
    /// - `ConnectionError::Closed` after [`shutdown`](Self::shutdown)
    pub async fn watch(
        &self,
        path: &str,
    ) -> Result<WatchStream> {
        validate_path(path)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }

        let (mut stream, mut ready_rx) = self.subscribe(path);
        let deadline = self.inner.session.config().ensure_connected_timeout();

        let settled = ready_rx.wait_for(|r| !matches!(r, Readiness::Pending));
        let readiness = match tokio::time::timeout(deadline, settled).await {
            Ok(Ok(readiness)) => readiness.clone(),
            Ok(Err(_)) => Readiness::Closed,
            Err(_) => return Err(ConnectionError::NotConnected(deadline).into()),
        };

        match readiness {
            Readiness::Ready(seed) => {
                if stream.initial.is_none() {
                    stream.initial = Some(seed);
                }
                debug!(path, "watch established");
                Ok(stream)
            }
            Readiness::Failed(e) => Err(e.into()),
            Readiness::Pending | Readiness::Closed => Err(ConnectionError::Closed.into()),
        }
    }

    /// Subscribes to `path` and feeds every event to `callback`, one at a time, on a
    /// dedicated task.
    pub async fn watch_with<F>(
        &self,
        path: &str,
        callback: F,
    ) -> Result<WatchHandle>
    where
        F: FnMut(WatchEvent) + Send + 'static,
    {
        let stream = self.watch(path).await?;
        Ok(WatchHandle::spawn(stream, callback))
    }

    pub fn status(
        &self,
        path: &str,
    ) -> Option<WatchStatus> {
        let watch = self.inner.watches.get(path)?.value().clone();
        let state = watch.state.lock();
        Some(WatchStatus {
            path: watch.path.clone(),
            phase: state.phase,
            armed: state.armed,
            last_delivered_version: state.last_delivered.as_ref().filter(|n| n.exists).map(|n| n.version),
            rearm_failures: state.rearm_failures,
            subscribers: state.subscribers.len(),
        })
    }

    pub fn watched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.watches.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Cancels every path task and ends all streams.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let paths = self.watched_paths();
        let mut handles = Vec::new();
        for path in paths {
            if let Some((_, watch)) = self.inner.watches.remove(&path) {
                if let Some(handle) = watch.handle.lock().take() {
                    handles.push(handle);
                }
            }
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("watch task ended abnormally: {:?}", e);
            }
        }
        info!("watch engine stopped");
    }

    fn subscribe(
        &self,
        path: &str,
    ) -> (WatchStream, watch::Receiver<Readiness>) {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.config.subscriber_buffer_size);
        let cancel = CancellationToken::new();

        let entry = self
            .inner
            .watches
            .entry(path.to_string())
            .or_insert_with(|| EngineInner::spawn_path(&self.inner, path));
        let watch = entry.value().clone();

        // joined while holding the entry, so an empty subscriber list is never observed
        let initial = {
            let mut state = watch.state.lock();
            state.subscribers.push(Subscriber {
                id,
                sender,
                cancel: cancel.clone(),
            });
            state.last_delivered.clone()
        };
        let ready_rx = watch.ready_tx.subscribe();
        drop(entry);

        trace!(path, subscriber = id, "watch subscriber registered");
        let stream = WatchStream::new(id, receiver, cancel, initial, watch, Arc::downgrade(&self.inner));
        (stream, ready_rx)
    }
}

impl EngineInner {
    fn spawn_path(
        this: &Arc<Self>,
        path: &str,
    ) -> Arc<PathWatch> {
        let (ready_tx, _) = watch::channel(Readiness::Pending);
        let watch = Arc::new(PathWatch {
            path: path.to_string(),
            state: Mutex::new(PathState {
                subscribers: Vec::new(),
                last_delivered: None,
                phase: WatchPhase::AwaitingSession,
                armed: false,
                rearm_failures: 0,
            }),
            cancel: this.shutdown.child_token(),
            ready_tx,
            handle: Mutex::new(None),
        });

        let task = tokio::spawn(Self::run(Arc::clone(this), Arc::clone(&watch)));
        *watch.handle.lock() = Some(task);
        debug!(path, "watch task spawned");
        watch
    }

    /// Drops subscriber `id`; the last one out stops the path task.
    pub(crate) fn unsubscribe(
        &self,
        watch: &Arc<PathWatch>,
        id: u64,
    ) {
        self.watches.remove_if(watch.path.as_str(), |_, current| {
            if !Arc::ptr_eq(current, watch) {
                return false;
            }
            let mut state = current.state.lock();
            state.subscribers.retain(|s| s.id != id);
            let empty = state.subscribers.is_empty();
            if empty {
                current.cancel.cancel();
            }
            empty
        });
        trace!(path = %watch.path, subscriber = id, "watch subscriber removed");
    }

    /// Dispatch loop of one path: ensure session, arm, read, deliver, wait, repeat.
    async fn run(
        inner: Arc<Self>,
        watch: Arc<PathWatch>,
    ) {
        let path = watch.path.as_str();
        let mut lifecycle = inner.session.subscribe();
        let mut failures = 0usize;
        let mut degraded = false;
        let mut source = ChangeSource::Notification;

        loop {
            // Degraded sticks until a re-arm succeeds
            if !degraded {
                watch.set_phase(WatchPhase::AwaitingSession, false);
            }
            let session = tokio::select! {
                _ = watch.cancel.cancelled() => break,
                session = inner.session.ensure_connected() => session,
            };

            let armed = match session {
                Ok(session) => {
                    if !degraded {
                        watch.set_phase(WatchPhase::Arming, false);
                    }
                    tokio::select! {
                        _ = watch.cancel.cancelled() => break,
                        armed = inner.arm_and_read(path, &session) => armed,
                    }
                }
                Err(e) => Err(e),
            };

            let (fired, node, session_id) = match armed {
                Ok(armed) => armed,
                Err(e) if e.is_permanent() => {
                    inner.fail_permanently(&watch, failures + 1, e);
                    break;
                }
                Err(e) => {
                    failures += 1;
                    watch.state.lock().rearm_failures = failures;
                    if failures >= inner.config.max_rearm_failures && !degraded {
                        degraded = true;
                        warn!(path, failures, "watch degraded: {}", e);
                        watch.set_phase(WatchPhase::Degraded, false);
                        let event = WatchEvent::Degraded {
                            path: path.to_string(),
                            attempts: failures,
                            reason: e.to_string(),
                            permanent: false,
                        };
                        if !watch.broadcast(event).await {
                            break;
                        }
                    } else {
                        debug!(path, failures, "re-arm failed: {}", e);
                    }
                    if !sleep_or_cancel(backoff_delay(&inner.config.rearm, failures), &watch.cancel).await {
                        break;
                    }
                    // the outage may have hidden a change
                    source = ChangeSource::Reconciliation;
                    continue;
                }
            };

            if degraded {
                degraded = false;
                info!(path, failures, "watch restored");
                if !watch.broadcast(WatchEvent::Restored { path: path.to_string() }).await {
                    break;
                }
            }
            failures = 0;
            {
                let mut state = watch.state.lock();
                state.rearm_failures = 0;
                state.phase = WatchPhase::Armed;
                state.armed = true;
            }

            if !watch.deliver_if_changed(node, source).await {
                break;
            }

            // events queued before this arm describe sessions already handled
            while !matches!(lifecycle.try_recv(), Err(TryRecvError::Empty | TryRecvError::Closed)) {}

            source = if inner.session.current().id != Some(session_id) {
                ChangeSource::Reconciliation
            } else {
                tokio::select! {
                    _ = watch.cancel.cancelled() => break,
                    fired = fired => match fired {
                        Ok(NodeEvent { kind: NodeEventKind::SessionLost, .. }) | Err(_) => ChangeSource::Reconciliation,
                        Ok(event) => {
                            trace!(path, kind = ?event.kind, "watch fired");
                            ChangeSource::Notification
                        }
                    },
                    _ = session_lost(&mut lifecycle, session_id) => ChangeSource::Reconciliation,
                }
            };
            watch.set_phase(WatchPhase::Fired, false);
        }

        watch.close();
        debug!(path, "watch task finished");
    }

    /// Arms the one-shot store watch, then reads the node.
    async fn arm_and_read(
        &self,
        path: &str,
        session: &Session,
    ) -> Result<(oneshot::Receiver<NodeEvent>, ConfigNode, SessionId)> {
        let id = session.live_id()?;
        let timeout = self.session.config().request_timeout();
        let store = self.session.store();

        let fired = with_timeout("watch", timeout, store.watch(id, path)).await?;
        let node = match with_timeout("get_data", timeout, store.get_data(id, path)).await {
            Ok((value, stat)) => {
                self.session.observe(&stat);
                ConfigNode::from_stat(path, value, &stat)
            }
            Err(Error::Store(StoreError::NoNode { .. })) => ConfigNode::absent(path),
            Err(e) => return Err(e),
        };
        Ok((fired, node, id))
    }

    fn fail_permanently(
        &self,
        watch: &Arc<PathWatch>,
        attempts: usize,
        e: Error,
    ) {
        error!(path = %watch.path, "watch failed permanently: {}", e);
        self.watches.remove_if(watch.path.as_str(), |_, current| Arc::ptr_eq(current, watch));

        let seeded = watch.state.lock().last_delivered.is_some();
        if !seeded {
            let readiness = match &e {
                Error::Store(store) => Readiness::Failed(store.clone()),
                _ => Readiness::Closed,
            };
            watch.ready_tx.send_replace(readiness);
        }

        let event = WatchEvent::Degraded {
            path: watch.path.clone(),
            attempts,
            reason: e.to_string(),
            permanent: true,
        };
        let state = watch.state.lock();
        for subscriber in state.subscribers.iter() {
            // subscribers are about to be dropped; a full buffer only loses this notice
            if subscriber.sender.try_send(event.clone()).is_err() {
                warn!(path = %watch.path, subscriber = subscriber.id, "degraded notice not delivered");
            }
        }
    }
}

impl PathWatch {
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    fn set_phase(
        &self,
        phase: WatchPhase,
        armed: bool,
    ) {
        let mut state = self.state.lock();
        state.phase = phase;
        state.armed = armed;
    }

    /// Seeds or compares against the last delivered node. Returns false once cancelled.
    async fn deliver_if_changed(
        &self,
        node: ConfigNode,
        source: ChangeSource,
    ) -> bool {
        let (event, subscribers) = {
            let mut state = self.state.lock();
            let Some(last) = state.last_delivered.as_ref() else {
                state.last_delivered = Some(node.clone());
                self.ready_tx.send_replace(Readiness::Ready(node));
                return true;
            };

            let changed = match source {
                ChangeSource::Notification => {
                    last.exists != node.exists || last.version != node.version || last.value != node.value
                }
                // a reconnect that finds the same value stays silent
                ChangeSource::Reconciliation => last.exists != node.exists || last.value != node.value,
            };
            if !changed {
                trace!(path = %self.path, ?source, "no change to deliver");
                state.last_delivered = Some(node);
                return true;
            }

            let event = WatchEvent::Changed(ConfigChangeEvent {
                path: self.path.clone(),
                value: node.exists.then(|| node.value.clone()),
                version: node.exists.then_some(node.version),
                timestamp_ms: get_now_as_millis(),
                source,
            });
            state.last_delivered = Some(node);
            (event, Self::snapshot(&state))
        };

        debug!(path = %self.path, ?source, "delivering change");
        self.send_to(subscribers, event).await
    }

    async fn broadcast(
        &self,
        event: WatchEvent,
    ) -> bool {
        let subscribers = Self::snapshot(&self.state.lock());
        self.send_to(subscribers, event).await
    }

    fn snapshot(state: &PathState) -> Vec<(mpsc::Sender<WatchEvent>, CancellationToken)> {
        state
            .subscribers
            .iter()
            .map(|s| (s.sender.clone(), s.cancel.clone()))
            .collect()
    }

    /// Sequential delivery; waits on full buffers instead of dropping.
    async fn send_to(
        &self,
        subscribers: Vec<(mpsc::Sender<WatchEvent>, CancellationToken)>,
        event: WatchEvent,
    ) -> bool {
        for (sender, cancel) in subscribers {
            if cancel.is_cancelled() {
                continue;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = cancel.cancelled() => {}
                // a closed receiver has unsubscribed already
                _ = sender.send(event.clone()) => {}
            }
        }
        true
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.phase = WatchPhase::Cancelled;
        state.armed = false;
        state.subscribers.clear();
        self.ready_tx.send_if_modified(|readiness| {
            if matches!(readiness, Readiness::Pending) {
                *readiness = Readiness::Closed;
                true
            } else {
                false
            }
        });
    }
}

/// Resolves when `id` is reported disconnected or expired.
async fn session_lost(
    lifecycle: &mut broadcast::Receiver<LifecycleEvent>,
    id: SessionId,
) {
    loop {
        match lifecycle.recv().await {
            Ok(LifecycleEvent::Disconnected { session_id }) if session_id == Some(id) => return,
            Ok(LifecycleEvent::Expired { session_id }) if session_id == id => return,
            Ok(_) => continue,
            Err(RecvError::Lagged(_)) => return,
            Err(RecvError::Closed) => futures::future::pending::<()>().await,
        }
    }
}
