//! RPC client module for the getstronger API.
//!
//! The API speaks the Connect protocol over HTTP. Every call flows through
//! `ResponseClassifier` -> `AuthenticatedTransport` -> `ConnectClient`, with
//! authentication failures flowing back into the refresh coordinator.

pub mod auth;
pub mod authenticated;
pub mod classifier;
pub mod connect;
pub mod error;
pub mod transport;

pub use auth::AuthApi;
pub use authenticated::AuthenticatedTransport;
pub use classifier::{classify_error, ClassifiedError, ErrorClass, ResponseClassifier};
pub use connect::ConnectClient;
pub use error::{ApiError, Code, DomainError, ErrorDetail, RemoteError};
pub use transport::{MessageStream, RpcRequest, RpcTransport};
