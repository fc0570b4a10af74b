//! Scripted collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use crate::api::{ApiError, Code, MessageStream, RemoteError, RpcRequest, RpcTransport};
use crate::auth::refresher::{AuthError, CredentialRefresher};
use crate::auth::Credential;
use crate::ui::{AlertSink, Navigator};

/// An unsigned JWT whose `userId` claim is `subject`.
pub fn token_for(subject: &str) -> String {
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"userId":"{}"}}"#, subject));
    format!("eyJhbGciOiJIUzI1NiJ9.{}.sig", payload)
}

pub fn credential_for(subject: &str) -> Credential {
    Credential::from_access_token(token_for(subject)).unwrap()
}

pub fn unauthenticated() -> ApiError {
    RemoteError::new(Code::Unauthenticated, "").into()
}

pub fn remote(code: Code, message: &str) -> ApiError {
    RemoteError::new(code, message).into()
}

type Responder = Box<dyn Fn(&RpcRequest) -> Result<Value, ApiError> + Send + Sync>;
type Latency = Box<dyn Fn(&RpcRequest) -> Duration + Send + Sync>;

pub enum StreamScript {
    /// Opening the stream fails.
    Fail(ApiError),
    /// The stream yields `items`, then either closes or stays open forever.
    Items {
        items: Vec<Result<Value, ApiError>>,
        hang: bool,
    },
}

struct OpenGuard {
    open: Arc<AtomicUsize>,
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport answering from per-procedure queues, then from a responder.
#[derive(Default)]
pub struct ScriptedTransport {
    unary: Mutex<HashMap<&'static str, VecDeque<Result<Value, ApiError>>>>,
    responder: Mutex<Option<Responder>>,
    latency: Mutex<Option<Latency>>,
    streams: Mutex<VecDeque<StreamScript>>,
    unary_requests: Mutex<Vec<RpcRequest>>,
    stream_requests: Mutex<Vec<RpcRequest>>,
    open_streams: Arc<AtomicUsize>,
    max_open_streams: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_unary(&self, procedure: &'static str, result: Result<Value, ApiError>) {
        self.unary
            .lock()
            .entry(procedure)
            .or_default()
            .push_back(result);
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&RpcRequest) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Delay each unary reply by `latency(request)`. The reply is chosen
    /// after the delay, so it sees state changed in the meantime.
    pub fn delay_with<F>(&self, latency: F)
    where
        F: Fn(&RpcRequest) -> Duration + Send + Sync + 'static,
    {
        *self.latency.lock() = Some(Box::new(latency));
    }

    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().push_back(script);
    }

    pub fn unary_requests(&self) -> Vec<RpcRequest> {
        self.unary_requests.lock().clone()
    }

    pub fn stream_requests(&self) -> Vec<RpcRequest> {
        self.stream_requests.lock().clone()
    }

    pub fn max_open_streams(&self) -> usize {
        self.max_open_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RpcTransport for ScriptedTransport {
    async fn unary(&self, request: RpcRequest) -> Result<Value, ApiError> {
        self.unary_requests.lock().push(request.clone());

        let delay = self.latency.lock().as_ref().map(|latency| latency(&request));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .unary
            .lock()
            .get_mut(request.procedure)
            .and_then(|queue| queue.pop_front());
        if let Some(result) = queued {
            return result;
        }

        match self.responder.lock().as_ref() {
            Some(responder) => responder(&request),
            None => Err(remote(Code::Unimplemented, request.procedure)),
        }
    }

    async fn server_stream(&self, request: RpcRequest) -> Result<MessageStream, ApiError> {
        self.stream_requests.lock().push(request);

        let script = self.streams.lock().pop_front().unwrap_or(StreamScript::Items {
            items: Vec::new(),
            hang: true,
        });

        let (items, hang) = match script {
            StreamScript::Fail(err) => return Err(err),
            StreamScript::Items { items, hang } => (items, hang),
        };

        let now_open = self.open_streams.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_streams.fetch_max(now_open, Ordering::SeqCst);
        let guard = OpenGuard {
            open: Arc::clone(&self.open_streams),
        };

        let tail: MessageStream = if hang {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };

        Ok(stream::iter(items)
            .chain(tail)
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed())
    }
}

/// Refresher that counts calls and answers from a queue after `delay`.
pub struct CountingRefresher {
    calls: AtomicUsize,
    outcomes: Mutex<VecDeque<Result<Credential, AuthError>>>,
    fallback: Result<Credential, AuthError>,
    delay: Duration,
}

impl CountingRefresher {
    pub fn succeeding(subject: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            outcomes: Mutex::new(VecDeque::new()),
            fallback: Ok(credential_for(subject)),
            delay: Duration::from_millis(50),
        }
    }

    pub fn failing(error: AuthError) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            outcomes: Mutex::new(VecDeque::new()),
            fallback: Err(error),
            delay: Duration::from_millis(50),
        }
    }

    pub fn push(&self, outcome: Result<Credential, AuthError>) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialRefresher for CountingRefresher {
    async fn refresh(&self) -> Result<Credential, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let queued = self.outcomes.lock().pop_front();
        queued.unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    paths: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate_to(&self, path: &str) {
        self.paths.lock().push(path.to_string());
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    messages: Mutex<Vec<String>>,
}

impl RecordingAlerts {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl AlertSink for RecordingAlerts {
    fn alert(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}
