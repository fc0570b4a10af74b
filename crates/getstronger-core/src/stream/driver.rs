//! Reconnecting driver for long-lived server streams.
//!
//! One driver owns at most one open stream. When the stream ends it backs off
//! and reopens, refreshing the credential first if the server rejected it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiError, MessageStream};
use crate::auth::RefreshCoordinator;

/// Default delay between reconnect attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Opens a fresh stream on every call.
pub type StreamOpener =
    Box<dyn Fn() -> BoxFuture<'static, Result<MessageStream, ApiError>> + Send + Sync>;

/// Receives every pushed message, in order.
pub type MessageHandler = Box<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Connecting,
    Streaming,
    Reconnecting,
}

/// Delay before each reconnect. Fixed; the streams driven here are advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    delay: Duration,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_BACKOFF)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Reconnects since the last successful open.
    pub reconnect_attempts: u32,
    /// Successful opens since the driver was created.
    pub connections: u64,
    pub last_error: Option<String>,
}

struct Inner {
    name: &'static str,
    open: StreamOpener,
    on_message: MessageHandler,
    coordinator: RefreshCoordinator,
    backoff: BackoffPolicy,
    state_tx: watch::Sender<StreamState>,
    stats: Mutex<StreamStats>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ResilientStream {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl ResilientStream {
    pub fn new(
        name: &'static str,
        open: StreamOpener,
        on_message: MessageHandler,
        coordinator: RefreshCoordinator,
        backoff: BackoffPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(StreamState::Stopped);
        Self {
            inner: Arc::new(Inner {
                name,
                open,
                on_message,
                coordinator,
                backoff,
                state_tx,
                stats: Mutex::new(StreamStats::default()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start streaming. Does nothing if already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!(stream = self.inner.name, "already running");
            return;
        }

        info!(stream = self.inner.name, "starting stream");
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(inner.run(cancel.clone()));
        *running = Some(Running { cancel, task });
    }

    /// Stop streaming, cancelling any pending backoff. Returns once the
    /// stream has been released.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        info!(stream = self.inner.name, "stopping stream");
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            if e.is_panic() {
                warn!(stream = self.inner.name, error = %e, "stream task panicked");
            }
        }
        self.inner.state_tx.send_replace(StreamState::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_state(&self) -> StreamState {
        *self.inner.state_tx.borrow()
    }

    pub fn stats(&self) -> StreamStats {
        self.inner.stats.lock().clone()
    }
}

impl Inner {
    fn set_state(&self, state: StreamState) {
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // Set after a refresh-and-reconnect; cleared once a stream opens.
        let mut reauthenticated = false;
        'session: loop {
            self.set_state(StreamState::Connecting);
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'session,
                opened = (self.open)() => opened,
            };

            let ending = match opened {
                Ok(mut stream) => {
                    reauthenticated = false;
                    self.on_connected();
                    let ending = loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'session,
                            item = stream.next() => match item {
                                Some(Ok(message)) => (self.on_message)(message),
                                Some(Err(err)) => break Some(err),
                                None => break None,
                            },
                        }
                    };
                    // Release the connection before any reconnect.
                    drop(stream);
                    ending
                }
                Err(err) => Some(err),
            };

            self.set_state(StreamState::Reconnecting);
            let attempt = self.on_ended(ending.as_ref());

            if ending.as_ref().is_some_and(ApiError::is_unauthenticated) {
                let refreshed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'session,
                    refreshed = self.coordinator.ensure_fresh_credential() => refreshed,
                };
                match refreshed {
                    Ok(_) if !reauthenticated => {
                        reauthenticated = true;
                        continue 'session;
                    }
                    Ok(_) => {
                        warn!(stream = self.name, "refreshed credential rejected, backing off")
                    }
                    Err(e) if e.is_terminal() => {
                        info!(stream = self.name, "session expired, giving up on stream");
                        break 'session;
                    }
                    Err(e) => warn!(stream = self.name, error = %e, "refresh failed, backing off"),
                }
            }

            let delay = self.backoff.delay();
            debug!(
                stream = self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting after delay"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'session,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(StreamState::Stopped);
        debug!(stream = self.name, "stream loop exited");
    }

    fn on_connected(&self) {
        self.set_state(StreamState::Streaming);
        let mut stats = self.stats.lock();
        stats.reconnect_attempts = 0;
        stats.connections += 1;
        debug!(stream = self.name, connections = stats.connections, "stream open");
    }

    fn on_ended(&self, ending: Option<&ApiError>) -> u32 {
        let mut stats = self.stats.lock();
        stats.reconnect_attempts += 1;
        match ending {
            Some(err) => {
                warn!(stream = self.name, error = %err, "stream ended with error");
                stats.last_error = Some(err.to_string());
            }
            None => debug!(stream = self.name, "stream closed by server"),
        }
        stats.reconnect_attempts
    }
}
