use parking_lot::RwLock;
use tokio::task::AbortHandle;
use tracing::debug;

use super::Credential;

#[derive(Default)]
struct SessionData {
    credential: Option<Credential>,
    refresh_timer: Option<AbortHandle>,
    /// Bumped by every `clear`, so work started before a logout can tell.
    epoch: u64,
}

/// Process-wide session: the current credential and the periodic refresh timer.
///
/// Owned by the composition root and shared by `Arc`. Reads always observe the
/// most recently completed write; the lock is never held across an await.
#[derive(Default)]
pub struct SessionState {
    data: RwLock<SessionData>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current credential, if any
    pub fn credential(&self) -> Option<Credential> {
        self.data.read().credential.clone()
    }

    /// Replace the credential wholesale
    pub fn set_credential(&self, credential: Credential) {
        debug!(subject_id = credential.subject_id(), "session credential updated");
        self.data.write().credential = Some(credential);
    }

    /// Replace the credential only if the session has not been cleared
    /// since `epoch` was read. Returns whether the credential was stored.
    pub fn set_credential_if_current(&self, epoch: u64, credential: Credential) -> bool {
        let mut data = self.data.write();
        if data.epoch != epoch {
            return false;
        }
        debug!(subject_id = credential.subject_id(), "session credential updated");
        data.credential = Some(credential);
        true
    }

    pub fn epoch(&self) -> u64 {
        self.data.read().epoch
    }

    /// Drop the credential and cancel the periodic refresh timer.
    /// Returns whether a credential was present.
    pub fn clear(&self) -> bool {
        self.clear_where(|_| true)
    }

    /// `clear`, but only if nothing else has cleared the session since `epoch`.
    pub fn clear_if_current(&self, epoch: u64) -> bool {
        self.clear_where(|current| current == epoch)
    }

    fn clear_where(&self, should_clear: impl FnOnce(u64) -> bool) -> bool {
        let (had_credential, timer) = {
            let mut data = self.data.write();
            if !should_clear(data.epoch) {
                return false;
            }
            data.epoch += 1;
            (data.credential.take().is_some(), data.refresh_timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if had_credential {
            debug!("session cleared");
        }
        had_credential
    }

    /// Install the periodic refresh timer, cancelling any previous one
    pub fn set_refresh_timer_handle(&self, handle: Option<AbortHandle>) {
        let previous = std::mem::replace(&mut self.data.write().refresh_timer, handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub(crate) fn take_refresh_timer_handle(&self) -> Option<AbortHandle> {
        self.data.write().refresh_timer.take()
    }

    pub fn has_refresh_timer(&self) -> bool {
        self.data.read().refresh_timer.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.data.read().credential.is_some()
    }

    pub fn subject_id(&self) -> Option<String> {
        self.data
            .read()
            .credential
            .as_ref()
            .map(|c| c.subject_id().to_string())
    }

    pub fn token(&self) -> Option<String> {
        self.data
            .read()
            .credential
            .as_ref()
            .map(|c| c.token().to_string())
    }
}
