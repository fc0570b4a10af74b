//! Composition root for the authenticated session.
//!
//! `SessionClient` owns the one `SessionState` and wires it into the refresh
//! coordinator, the authenticated transport, the classifier and the unread
//! stream. Everything above it talks to the API only through this type.

use std::sync::Arc;
use std::time::Duration;

use reqwest_cookie_store::CookieStoreMutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::auth::SignupRequest;
use crate::api::{
    ApiError, AuthApi, AuthenticatedTransport, ClassifiedError, ConnectClient, ResponseClassifier,
    RpcRequest, RpcTransport,
};
use crate::auth::{
    ClaimsError, Credential, RefreshCoordinator, RpcCredentialRefresher, SessionState,
};
use crate::config::Config;
use crate::stream::{BackoffPolicy, UnreadCountStream};
use crate::ui::{AlertSink, Navigator};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Call(#[from] ClassifiedError),

    #[error("could not build request: {0}")]
    Request(#[source] ApiError),

    #[error("server returned an unusable access token: {0}")]
    Claims(#[from] ClaimsError),
}

impl SessionError {
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            SessionError::Call(err) => Some(err),
            _ => None,
        }
    }
}

pub struct SessionClient {
    session: Arc<SessionState>,
    auth: AuthApi,
    coordinator: RefreshCoordinator,
    transport: Arc<AuthenticatedTransport>,
    classifier: ResponseClassifier,
    unread: UnreadCountStream,
    refresh_interval: Duration,
}

impl SessionClient {
    /// Connect to the API named in `config`, keeping cookies in `cookies`.
    pub fn new(
        config: &Config,
        cookies: Arc<CookieStoreMutex>,
        navigator: Arc<dyn Navigator>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self, ApiError> {
        let connect =
            ConnectClient::new(config.api_url.clone(), config.request_timeout(), cookies)?;
        Ok(Self::with_transport(
            config,
            Arc::new(connect),
            navigator,
            alerts,
        ))
    }

    /// Build on an existing wire transport. `raw` must not attach a bearer
    /// credential itself; it carries the refresh cookie.
    pub fn with_transport(
        config: &Config,
        raw: Arc<dyn RpcTransport>,
        navigator: Arc<dyn Navigator>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let session = Arc::new(SessionState::new());
        let auth = AuthApi::new(Arc::clone(&raw));
        let refresher = Arc::new(RpcCredentialRefresher::new(auth.clone()));
        let coordinator =
            RefreshCoordinator::new(refresher, Arc::clone(&session), Arc::clone(&navigator));
        let transport = Arc::new(AuthenticatedTransport::new(
            raw,
            Arc::clone(&session),
            coordinator.clone(),
        ));
        let classifier =
            ResponseClassifier::new(Arc::clone(&session), coordinator.clone(), navigator, alerts);
        let unread = UnreadCountStream::new(
            transport.clone(),
            coordinator.clone(),
            BackoffPolicy::fixed(config.stream_backoff()),
        );

        Self {
            session,
            auth,
            coordinator,
            transport,
            classifier,
            unread,
            refresh_interval: config.refresh_interval(),
        }
    }

    /// Log in and start the session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential, SessionError> {
        info!("logging in");
        let token = self
            .classifier
            .classify(move || self.auth.login(email, password))
            .await?;
        let credential = Credential::from_access_token(token)?;
        self.begin(credential.clone());
        Ok(credential)
    }

    /// Create an account. The user must verify their email before logging in.
    pub async fn signup(&self, request: &SignupRequest) -> Result<(), SessionError> {
        info!("signing up");
        self.classifier
            .classify(move || self.auth.signup(request))
            .await?;
        Ok(())
    }

    /// Start the session from a previously saved credential.
    pub fn resume(&self, credential: Credential) {
        info!(subject_id = credential.subject_id(), "resuming session");
        self.begin(credential);
    }

    fn begin(&self, credential: Credential) {
        self.session.set_credential(credential);
        self.coordinator.start_periodic_refresh(self.refresh_interval);
        self.unread.start();
    }

    /// End the session locally right away. The server-side logout runs in
    /// the background; its failure is only logged.
    pub async fn logout(&self) -> JoinHandle<()> {
        info!("logging out");
        let auth = self.auth.clone();
        let remote = tokio::spawn(async move {
            match auth.logout().await {
                Ok(()) => debug!("server session ended"),
                Err(e) => warn!(error = %e, "logout call failed"),
            }
        });

        self.coordinator.stop_periodic_refresh();
        self.session.clear();
        self.unread.stop().await;
        remote
    }

    /// Stop background work but keep the credential, e.g. before exiting.
    pub async fn shutdown(&self) {
        self.coordinator.stop_periodic_refresh();
        self.unread.stop().await;
    }

    /// Invoke an application procedure with the full auth and error policy.
    pub async fn call<M: Serialize>(
        &self,
        procedure: &'static str,
        message: &M,
    ) -> Result<Value, SessionError> {
        let request = RpcRequest::new(procedure, message).map_err(SessionError::Request)?;
        let transport = &self.transport;
        let value = self
            .classifier
            .classify(move || transport.unary(request.clone()))
            .await?;
        Ok(value)
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn transport(&self) -> Arc<dyn RpcTransport> {
        self.transport.clone()
    }

    pub fn classifier(&self) -> &ResponseClassifier {
        &self.classifier
    }

    pub fn unread(&self) -> &UnreadCountStream {
        &self.unread
    }

    pub fn credential(&self) -> Option<Credential> {
        self.session.credential()
    }
}
