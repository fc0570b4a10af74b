//! Core library for the getstronger client.
//!
//! This crate owns the authenticated RPC session layer:
//! - `auth`: credentials, session state, single-flight token refresh
//! - `api`: RPC transport, bearer attachment with one retry, error classification
//! - `stream`: long-lived server-push subscriptions that survive reconnects
//! - `client`: the composition root wiring all of the above together

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod stream;
pub mod ui;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiError, ClassifiedError, Code, ErrorClass, RemoteError, ResponseClassifier};
pub use auth::{Credential, RefreshCoordinator, RefreshError, SessionState};
pub use client::{SessionClient, SessionError};
pub use config::Config;
pub use stream::{StreamState, UnreadCountStream};
pub use ui::{AlertSink, Navigator};
