//! Call primitives shared by every layer of the RPC stack.
//!
//! `RpcTransport` is the seam between policy (bearer attachment, retries,
//! classification) and the wire. Decorators implement it by wrapping another
//! `Arc<dyn RpcTransport>`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;

use super::ApiError;

/// Messages pushed by a server stream; the sequence ends on error or close.
pub type MessageStream = BoxStream<'static, Result<Value, ApiError>>;

/// A single outbound call: procedure path, JSON message and headers.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub procedure: &'static str,
    pub message: Value,
    pub headers: HeaderMap,
}

impl RpcRequest {
    pub fn new<T: Serialize>(procedure: &'static str, message: &T) -> Result<Self, ApiError> {
        Ok(Self {
            procedure,
            message: serde_json::to_value(message)?,
            headers: HeaderMap::new(),
        })
    }

    /// Attach a bearer credential, replacing any previous one.
    /// An absent or unusable token leaves the header omitted.
    pub fn set_bearer(&mut self, token: Option<&str>) {
        self.headers.remove(header::AUTHORIZATION);
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return;
        };
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
            self.headers.insert(header::AUTHORIZATION, value);
        }
    }

    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
    }
}

#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Invoke a unary procedure.
    async fn unary(&self, request: RpcRequest) -> Result<Value, ApiError>;

    /// Open a server-streaming procedure.
    async fn server_stream(&self, request: RpcRequest) -> Result<MessageStream, ApiError>;
}
