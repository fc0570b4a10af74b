//! Single-flight token refresh.
//!
//! At most one refresh call is in flight system-wide. Callers arriving while
//! one is pending join it and receive the same outcome. The refresh itself
//! runs on its own task so it settles even if every waiter goes away.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::refresher::{AuthError, CredentialRefresher};
use super::{Credential, SessionState};
use crate::ui::{Navigator, LOGOUT_PATH};

/// Default period of the background refresh.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// The session is over and has been torn down.
    #[error("session expired")]
    SessionExpired,

    #[error("{0}")]
    Transient(String),
}

impl RefreshError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefreshError::SessionExpired)
    }
}

pub type RefreshOutcome = Result<Credential, RefreshError>;

type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct CoordinatorState {
    refresher: Arc<dyn CredentialRefresher>,
    session: Arc<SessionState>,
    navigator: Arc<dyn Navigator>,
    in_flight: Mutex<Option<PendingRefresh>>,
}

impl CoordinatorState {
    /// `epoch` is the session epoch when the refresh was requested.
    async fn refresh_once(&self, epoch: u64) -> RefreshOutcome {
        info!("refreshing access token");
        let outcome = match self.refresher.refresh().await {
            Ok(credential) => {
                if self.session.set_credential_if_current(epoch, credential.clone()) {
                    info!("refreshed access token");
                    Ok(credential)
                } else {
                    info!("session ended while refreshing, discarding token");
                    Err(RefreshError::SessionExpired)
                }
            }
            Err(AuthError::Unauthenticated) => {
                warn!("user unauthenticated: logging out");
                if self.session.clear_if_current(epoch) {
                    self.navigator.navigate_to(LOGOUT_PATH);
                }
                Err(RefreshError::SessionExpired)
            }
            Err(AuthError::Transient(reason)) => {
                warn!(error = %reason, "failed to refresh access token");
                Err(RefreshError::Transient(reason))
            }
        };
        self.in_flight.lock().take();
        outcome
    }
}

/// Wraps a `CredentialRefresher` with single-flight de-duplication and a
/// periodic timer. Clone is cheap and clones share the in-flight marker.
#[derive(Clone)]
pub struct RefreshCoordinator {
    state: Arc<CoordinatorState>,
}

impl RefreshCoordinator {
    pub fn new(
        refresher: Arc<dyn CredentialRefresher>,
        session: Arc<SessionState>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            state: Arc::new(CoordinatorState {
                refresher,
                session,
                navigator,
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Refresh the credential, joining a pending refresh if there is one.
    pub async fn ensure_fresh_credential(&self) -> RefreshOutcome {
        let pending = {
            let mut in_flight = self.state.in_flight.lock();
            match in_flight.as_ref() {
                Some(pending) => {
                    debug!("joining in-flight refresh");
                    pending.clone()
                }
                None => {
                    let pending = self.spawn_refresh();
                    *in_flight = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.in_flight.lock().is_some()
    }

    fn spawn_refresh(&self) -> PendingRefresh {
        let state = Arc::clone(&self.state);
        let epoch = state.session.epoch();
        let task = tokio::spawn(async move { state.refresh_once(epoch).await });

        let state = Arc::clone(&self.state);
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    state.in_flight.lock().take();
                    Err(RefreshError::Transient(format!("refresh task failed: {}", e)))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Refresh every `period` while a session exists. Replaces any running timer.
    pub fn start_periodic_refresh(&self, period: Duration) {
        if period.is_zero() {
            warn!("periodic refresh disabled: zero period");
            return;
        }
        info!(period_secs = period.as_secs(), "scheduling access token refresh");
        let coordinator = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !coordinator.state.session.is_authenticated() {
                    debug!("no session, skipping periodic refresh");
                    continue;
                }
                match coordinator.ensure_fresh_credential().await {
                    Ok(_) => {}
                    Err(e) if e.is_terminal() => break,
                    Err(e) => warn!(error = %e, "periodic refresh failed"),
                }
            }
        });
        self.state
            .session
            .set_refresh_timer_handle(Some(task.abort_handle()));
    }

    pub fn stop_periodic_refresh(&self) {
        if let Some(handle) = self.state.session.take_refresh_timer_handle() {
            debug!("stopping periodic refresh");
            handle.abort();
        }
    }
}
