//! Auth service endpoints: the sources and sinks of credentials.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ApiError, RpcRequest, RpcTransport};

pub const LOGIN: &str = "api.v1.AuthService/Login";
pub const SIGNUP: &str = "api.v1.AuthService/Signup";
pub const REFRESH_TOKEN: &str = "api.v1.AuthService/RefreshToken";
pub const LOGOUT: &str = "api.v1.AuthService/Logout";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub password_confirmation: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: String,
}

fn access_token(response: Value) -> Result<String, ApiError> {
    let response: AccessTokenResponse = serde_json::from_value(response)?;
    if response.access_token.is_empty() {
        return Err(ApiError::InvalidResponse(
            "response carried no access token".to_string(),
        ));
    }
    Ok(response.access_token)
}

/// Auth endpoints over a transport that attaches no bearer credential.
/// The refresh token travels as an HTTP-only cookie held by the transport.
#[derive(Clone)]
pub struct AuthApi {
    transport: Arc<dyn RpcTransport>,
}

impl AuthApi {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self { transport }
    }

    /// Log in and return the access token
    pub async fn login(&self, email: &str, password: &str) -> Result<String, ApiError> {
        let request = RpcRequest::new(LOGIN, &LoginRequest { email, password })?;
        access_token(self.transport.unary(request).await?)
    }

    /// Create an account. The server emails a verification link; login fails
    /// until it is followed.
    pub async fn signup(&self, request: &SignupRequest) -> Result<(), ApiError> {
        let request = RpcRequest::new(SIGNUP, request)?;
        self.transport.unary(request).await?;
        Ok(())
    }

    /// Exchange the refresh cookie for a new access token
    pub async fn refresh_token(&self) -> Result<String, ApiError> {
        let request = RpcRequest::new(REFRESH_TOKEN, &serde_json::json!({}))?;
        access_token(self.transport.unary(request).await?)
    }

    /// Invalidate the refresh cookie server-side
    pub async fn logout(&self) -> Result<(), ApiError> {
        let request = RpcRequest::new(LOGOUT, &serde_json::json!({}))?;
        self.transport.unary(request).await?;
        Ok(())
    }
}
