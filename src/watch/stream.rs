use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Weak;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::debug;
use tracing::error;

use super::EngineInner;
use super::PathWatch;
use super::WatchEvent;
use crate::ConfigNode;

/// Infinite stream of [`WatchEvent`]s for one path
///
/// Ends only when cancelled, when the engine shuts down, or after a permanent
/// [`WatchEvent::Degraded`]. Dropping the stream unsubscribes.
pub struct WatchStream {
    id: u64,
    path: String,
    events: ReceiverStream<WatchEvent>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    pub(super) initial: Option<ConfigNode>,
    watch: Arc<PathWatch>,
    engine: Weak<EngineInner>,
    unsubscribed: bool,
}

impl std::fmt::Debug for WatchStream {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchStream")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WatchStream {
    pub(super) fn new(
        id: u64,
        receiver: mpsc::Receiver<WatchEvent>,
        cancel: CancellationToken,
        initial: Option<ConfigNode>,
        watch: Arc<PathWatch>,
        engine: Weak<EngineInner>,
    ) -> Self {
        Self {
            id,
            path: watch.path().to_string(),
            events: ReceiverStream::new(receiver),
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
            initial,
            watch,
            engine,
            unsubscribed: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Node state read when the watch was established; never emitted as an event
    pub fn initial(&self) -> Option<&ConfigNode> {
        self.initial.as_ref()
    }

    /// Stops delivery. No event is yielded after this returns.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.unsubscribe();
    }

    /// Token cancelling this stream from another task
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn unsubscribe(&mut self) {
        if self.unsubscribed {
            return;
        }
        self.unsubscribed = true;
        if let Some(engine) = self.engine.upgrade() {
            engine.unsubscribe(&self.watch, self.id);
        }
    }
}

impl Stream for WatchStream {
    type Item = WatchEvent;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.unsubscribe();
            return Poll::Ready(None);
        }
        match this.events.poll_next_unpin(cx) {
            // cancelled while the event was in flight
            Poll::Ready(Some(_)) if this.cancel.is_cancelled() => Poll::Ready(None),
            other => other,
        }
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.unsubscribe();
    }
}

/// Consumer task created by [`crate::WatchEngine::watch_with`]
///
/// Dropping the handle cancels the watch.
#[derive(Debug)]
pub struct WatchHandle {
    path: String,
    initial: Option<ConfigNode>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatchHandle {
    pub(super) fn spawn<F>(
        mut stream: WatchStream,
        mut callback: F,
    ) -> Self
    where
        F: FnMut(WatchEvent) + Send + 'static,
    {
        let path = stream.path().to_string();
        let initial = stream.initial().cloned();
        let cancel = stream.cancel_token();

        let task = {
            let cancel = cancel.clone();
            let path = path.clone();
            tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    callback(event);
                }
                debug!(path = %path, "watch consumer finished");
            })
        };

        Self {
            path,
            initial,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn initial(&self) -> Option<&ConfigNode> {
        self.initial.as_ref()
    }

    /// Requests cancellation; a callback already running finishes first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels and waits for the consumer; no callback runs after this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(path = %self.path, "watch consumer ended abnormally: {:?}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.lock().as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
