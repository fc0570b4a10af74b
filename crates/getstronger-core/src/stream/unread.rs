use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::driver::{
    BackoffPolicy, MessageHandler, ResilientStream, StreamOpener, StreamState, StreamStats,
};
use crate::api::{ApiError, RpcRequest, RpcTransport};
use crate::auth::RefreshCoordinator;

pub const UNREAD_NOTIFICATIONS: &str = "api.v1.NotificationService/UnreadNotifications";

#[derive(Debug, Default, Deserialize)]
struct UnreadNotificationsResponse {
    #[serde(default, deserialize_with = "deserialize_int64")]
    count: i64,
}

/// int64 fields arrive as JSON strings, but accept plain numbers too.
fn deserialize_int64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Number(i64),
        Text(String),
    }

    match Int64::deserialize(deserializer)? {
        Int64::Number(n) => Ok(n),
        Int64::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn parse_count(message: Value) -> Result<i64, ApiError> {
    let response: UnreadNotificationsResponse = serde_json::from_value(message)?;
    Ok(response.count)
}

/// Live unread-notification count, kept current across reconnects.
///
/// The count only changes when the server pushes a new value or the stream
/// is stopped; reconnecting never resets it.
pub struct UnreadCountStream {
    driver: ResilientStream,
    count_tx: Arc<watch::Sender<i64>>,
}

impl UnreadCountStream {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        coordinator: RefreshCoordinator,
        backoff: BackoffPolicy,
    ) -> Self {
        let (count_tx, _) = watch::channel(0);
        let count_tx = Arc::new(count_tx);

        let open: StreamOpener = Box::new(move || {
            let transport = Arc::clone(&transport);
            async move {
                let request = RpcRequest::new(UNREAD_NOTIFICATIONS, &serde_json::json!({}))?;
                transport.server_stream(request).await
            }
            .boxed()
        });

        let sink = Arc::clone(&count_tx);
        let on_message: MessageHandler = Box::new(move |message| match parse_count(message) {
            Ok(count) => {
                debug!(count, "unread notifications");
                sink.send_if_modified(|current| {
                    let changed = *current != count;
                    *current = count;
                    changed
                });
            }
            Err(e) => warn!(error = %e, "ignoring malformed unread notifications message"),
        });

        Self {
            driver: ResilientStream::new(
                "unread_notifications",
                open,
                on_message,
                coordinator,
                backoff,
            ),
            count_tx,
        }
    }

    pub fn start(&self) {
        self.driver.start();
    }

    /// Stop the stream and reset the count.
    pub async fn stop(&self) {
        self.driver.stop().await;
        self.count_tx.send_replace(0);
    }

    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.count_tx.subscribe()
    }

    pub fn unread_count(&self) -> i64 {
        *self.count_tx.borrow()
    }

    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.driver.state()
    }

    pub fn current_state(&self) -> StreamState {
        self.driver.current_state()
    }

    pub fn stats(&self) -> StreamStats {
        self.driver.stats()
    }

    pub fn is_running(&self) -> bool {
        self.driver.is_running()
    }
}
