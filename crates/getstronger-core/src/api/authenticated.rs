//! Bearer attachment with a single refresh-and-retry.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{ApiError, MessageStream, RpcRequest, RpcTransport};
use crate::auth::{RefreshCoordinator, SessionState};

/// Which attempt of a logical call is being made. There is no third.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Original,
    Retry,
}

/// Attaches the current credential to every call. When the server answers
/// `Unauthenticated`, refreshes through the coordinator and retries once.
pub struct AuthenticatedTransport {
    inner: Arc<dyn RpcTransport>,
    session: Arc<SessionState>,
    coordinator: RefreshCoordinator,
}

impl AuthenticatedTransport {
    pub fn new(
        inner: Arc<dyn RpcTransport>,
        session: Arc<SessionState>,
        coordinator: RefreshCoordinator,
    ) -> Self {
        Self {
            inner,
            session,
            coordinator,
        }
    }

    /// Attach the current credential. Returns the token that was attached.
    fn authorize(&self, request: &mut RpcRequest, attempt: Attempt) -> Option<String> {
        let token = self.session.token();
        debug!(
            procedure = request.procedure,
            ?attempt,
            authenticated = token.is_some(),
            "sending message"
        );
        request.set_bearer(token.as_deref());
        token
    }

    async fn with_retry<T, F, Fut>(&self, request: RpcRequest, send: F) -> Result<T, ApiError>
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ApiError>> + Send,
        T: Send,
    {
        let procedure = request.procedure;
        let mut original = request.clone();
        let sent = self.authorize(&mut original, Attempt::Original);
        let err = match send(original).await {
            Err(err) if err.is_unauthenticated() => err,
            other => return other,
        };

        let mut retry = request;
        let current = self.session.token();
        if current.is_some() && current != sent {
            debug!(procedure, "credential replaced while in flight, retrying request");
            self.authorize(&mut retry, Attempt::Retry);
            return send(retry).await;
        }

        match self.coordinator.ensure_fresh_credential().await {
            Ok(_) => {
                debug!(procedure, "refreshed access token, retrying request");
                self.authorize(&mut retry, Attempt::Retry);
                send(retry).await
            }
            Err(refresh_err) => {
                warn!(procedure, error = %refresh_err, "refresh failed, not retrying");
                Err(err)
            }
        }
    }
}

#[async_trait]
impl RpcTransport for AuthenticatedTransport {
    async fn unary(&self, request: RpcRequest) -> Result<Value, ApiError> {
        let inner = &self.inner;
        self.with_retry(request, move |request| inner.unary(request))
            .await
    }

    async fn server_stream(&self, request: RpcRequest) -> Result<MessageStream, ApiError> {
        let inner = &self.inner;
        self.with_retry(request, move |request| inner.server_stream(request))
            .await
    }
}
