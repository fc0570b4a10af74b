use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::Credential;
use crate::api::{ApiError, AuthApi, Code};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The server rejected the refresh outright; the session is over.
    #[error("refresh rejected: session expired")]
    Unauthenticated,

    /// Anything else; the caller may retry by its own policy.
    #[error("refresh failed: {0}")]
    Transient(String),
}

/// Performs one remote refresh call.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> Result<Credential, AuthError>;
}

/// Refresher backed by the auth service's refresh endpoint.
pub struct RpcCredentialRefresher {
    auth: AuthApi,
}

impl RpcCredentialRefresher {
    /// `auth` must use a transport that attaches no bearer credential.
    pub fn new(auth: AuthApi) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl CredentialRefresher for RpcCredentialRefresher {
    async fn refresh(&self) -> Result<Credential, AuthError> {
        let token = match self.auth.refresh_token().await {
            Ok(token) => token,
            Err(e) if is_rejection(&e) => {
                debug!(error = %e, "refresh token rejected");
                return Err(AuthError::Unauthenticated);
            }
            Err(e) => return Err(AuthError::Transient(e.to_string())),
        };

        Credential::from_access_token(token).map_err(|e| {
            warn!(error = %e, "refreshed access token could not be decoded");
            AuthError::Transient(e.to_string())
        })
    }
}

/// The refresh endpoint answers a missing or unknown refresh token with
/// `Unauthenticated` and an expired or malformed one with `InvalidArgument`.
fn is_rejection(err: &ApiError) -> bool {
    matches!(
        err.code(),
        Some(Code::Unauthenticated | Code::InvalidArgument)
    )
}
