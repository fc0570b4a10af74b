//! Server-push subscriptions that survive disconnects.

pub mod driver;
pub mod unread;

pub use driver::{BackoffPolicy, ResilientStream, StreamState, StreamStats, DEFAULT_BACKOFF};
pub use unread::{UnreadCountStream, UNREAD_NOTIFICATIONS};
