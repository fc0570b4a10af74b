//! Authentication module for managing the session credential.
//!
//! This module provides:
//! - `Credential`: bearer token plus the identity decoded from its claims
//! - `SessionState`: the single in-memory session shared by every call
//! - `RefreshCoordinator`: single-flight and periodic token refresh
//! - `SessionStore`: optional on-disk copy of the last credential and cookies
//!
//! Access tokens are short-lived; the refresh token lives in an HTTP-only
//! cookie that only the transport and the cookie jar see.

pub mod coordinator;
pub mod credential;
pub mod refresher;
pub mod session;
pub mod store;

pub use coordinator::{RefreshCoordinator, RefreshError, RefreshOutcome, DEFAULT_REFRESH_INTERVAL};
pub use credential::{ClaimsError, Credential};
pub use refresher::{AuthError, CredentialRefresher, RpcCredentialRefresher};
pub use session::SessionState;
pub use reqwest_cookie_store::CookieStoreMutex;
pub use store::{SessionStore, StoredSession};
