//! Call-site error policy.
//!
//! Every application call runs through [`ResponseClassifier::classify`], which
//! turns a failure into exactly one [`ErrorClass`] and performs its side
//! effect (alert, redirect) at most once.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ApiError, Code};
use crate::auth::{RefreshCoordinator, SessionState};
use crate::ui::{AlertSink, Navigator, LOGOUT_PATH};

/// Codes that never produce an alert.
pub const DEFAULT_IGNORED_CODES: [Code; 3] =
    [Code::Unauthenticated, Code::Unavailable, Code::Canceled];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// The credential was rejected; a refresh may recover the call.
    RetryableAuth,
    /// Not a remote error. The caller decides whether to try again.
    RetryableTransient,
    /// The session is gone; the user was sent to the logged-out screen.
    Redirect,
    /// Shown to the user.
    UserAlert(String),
    /// Expected noise, nothing shown.
    Ignored,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::RetryableAuth => f.write_str("retryable auth failure"),
            ErrorClass::RetryableTransient => f.write_str("transient failure"),
            ErrorClass::Redirect => f.write_str("redirected to login"),
            ErrorClass::UserAlert(message) => write!(f, "alert: {}", message),
            ErrorClass::Ignored => f.write_str("ignored"),
        }
    }
}

/// A failed call together with how it was handled.
#[derive(Error, Debug)]
#[error("{class} ({source})")]
pub struct ClassifiedError {
    pub class: ErrorClass,
    #[source]
    pub source: ApiError,
}

impl ClassifiedError {
    pub fn is_redirect(&self) -> bool {
        self.class == ErrorClass::Redirect
    }
}

/// Classify a single failure without side effects.
///
/// Domain details win over the code: a `FailedPrecondition` carrying
/// `EMAIL_NOT_VERIFIED` alerts with the fixed message, never the raw code.
pub fn classify_error(err: &ApiError, ignored: &[Code]) -> ErrorClass {
    let Some(remote) = err.remote() else {
        return ErrorClass::RetryableTransient;
    };

    if remote.code == Code::Unauthenticated {
        return ErrorClass::RetryableAuth;
    }

    if let Some(message) = remote.domain_errors().find_map(|d| d.user_message()) {
        return ErrorClass::UserAlert(message.to_string());
    }

    if ignored.contains(&remote.code) {
        return ErrorClass::Ignored;
    }

    ErrorClass::UserAlert(remote.to_string())
}

pub struct ResponseClassifier {
    session: Arc<SessionState>,
    coordinator: RefreshCoordinator,
    navigator: Arc<dyn Navigator>,
    alerts: Arc<dyn AlertSink>,
    ignored: Vec<Code>,
}

impl ResponseClassifier {
    pub fn new(
        session: Arc<SessionState>,
        coordinator: RefreshCoordinator,
        navigator: Arc<dyn Navigator>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            session,
            coordinator,
            navigator,
            alerts,
            ignored: DEFAULT_IGNORED_CODES.to_vec(),
        }
    }

    /// Replace the ignore-list.
    pub fn with_ignored(mut self, codes: impl IntoIterator<Item = Code>) -> Self {
        self.ignored = codes.into_iter().collect();
        self
    }

    pub fn ignored(&self) -> &[Code] {
        &self.ignored
    }

    /// Run `call`, refreshing and re-running it once if the credential is
    /// rejected. Failures come back classified, with their side effect done.
    pub async fn classify<T, F, Fut>(&self, call: F) -> Result<T, ClassifiedError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match classify_error(&err, &self.ignored) {
            ErrorClass::RetryableAuth => {}
            class => return Err(self.settle(class, err)),
        }

        if let Err(refresh_err) = self.coordinator.ensure_fresh_credential().await {
            info!(error = %refresh_err, "could not recover credential");
            return Err(self.settle(ErrorClass::Redirect, err));
        }

        match call().await {
            Ok(value) => Ok(value),
            Err(err) => {
                let class = match classify_error(&err, &self.ignored) {
                    ErrorClass::RetryableAuth => ErrorClass::Redirect,
                    class => class,
                };
                Err(self.settle(class, err))
            }
        }
    }

    fn settle(&self, class: ErrorClass, source: ApiError) -> ClassifiedError {
        match &class {
            ErrorClass::UserAlert(message) => {
                warn!(error = %source, "alerting user");
                self.alerts.alert(message);
            }
            ErrorClass::Redirect => {
                if self.session.clear() {
                    info!("session rejected, redirecting to login");
                    self.navigator.navigate_to(LOGOUT_PATH);
                }
            }
            ErrorClass::Ignored | ErrorClass::RetryableTransient | ErrorClass::RetryableAuth => {
                debug!(error = %source, %class, "call failed");
            }
        }
        ClassifiedError { class, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DomainError, ErrorDetail, RemoteError};
    use crate::auth::AuthError;
    use crate::test_support::{
        credential_for, remote, unauthenticated, CountingRefresher, RecordingAlerts,
        RecordingNavigator,
    };
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        refresher: Arc<CountingRefresher>,
        session: Arc<SessionState>,
        navigator: Arc<RecordingNavigator>,
        alerts: Arc<RecordingAlerts>,
        classifier: ResponseClassifier,
    }

    fn fixture(refresher: CountingRefresher) -> Fixture {
        let refresher = Arc::new(refresher);
        let session = Arc::new(SessionState::new());
        let navigator = Arc::new(RecordingNavigator::default());
        let alerts = Arc::new(RecordingAlerts::default());
        let coordinator =
            RefreshCoordinator::new(refresher.clone(), session.clone(), navigator.clone());
        let classifier =
            ResponseClassifier::new(session.clone(), coordinator, navigator.clone(), alerts.clone());
        Fixture {
            refresher,
            session,
            navigator,
            alerts,
            classifier,
        }
    }

    /// A call that answers from a script, one result per invocation.
    struct ScriptedCall {
        results: Mutex<VecDeque<Result<u32, ApiError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedCall {
        fn new(results: Vec<Result<u32, ApiError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            }
        }

        async fn call(&self) -> Result<u32, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(remote(Code::Internal, "script exhausted")))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn email_not_verified() -> ApiError {
        RemoteError::new(Code::FailedPrecondition, "email not verified")
            .with_detail(ErrorDetail::Domain(DomainError::EmailNotVerified))
            .into()
    }

    #[test]
    fn test_classify_error_rules() {
        let ignored = DEFAULT_IGNORED_CODES;
        assert_eq!(
            classify_error(&unauthenticated(), &ignored),
            ErrorClass::RetryableAuth
        );
        assert_eq!(
            classify_error(&remote(Code::Unavailable, "down"), &ignored),
            ErrorClass::Ignored
        );
        assert_eq!(
            classify_error(&remote(Code::Canceled, ""), &ignored),
            ErrorClass::Ignored
        );
        assert_eq!(
            classify_error(&remote(Code::NotFound, "no such routine"), &ignored),
            ErrorClass::UserAlert("not_found: no such routine".to_string())
        );
        assert_eq!(
            classify_error(&ApiError::InvalidResponse("eof".into()), &ignored),
            ErrorClass::RetryableTransient
        );
    }

    #[test]
    fn test_domain_detail_beats_code() {
        let err: ApiError = RemoteError::new(Code::Unavailable, "nope")
            .with_detail(ErrorDetail::Domain(DomainError::PasswordsDoNotMatch))
            .into();
        assert_eq!(
            classify_error(&err, &DEFAULT_IGNORED_CODES),
            ErrorClass::UserAlert("Passwords do not match".to_string())
        );

        // A domain error without a fixed message falls back to the code.
        let err: ApiError = RemoteError::new(Code::InvalidArgument, "bad")
            .with_detail(ErrorDetail::Domain(DomainError::Other(42)))
            .into();
        assert_eq!(
            classify_error(&err, &DEFAULT_IGNORED_CODES),
            ErrorClass::UserAlert("invalid_argument: bad".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_passes_through() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        let call = ScriptedCall::new(vec![Ok(7)]);

        assert_eq!(f.classifier.classify(|| call.call()).await.unwrap(), 7);
        assert!(f.alerts.messages().is_empty());
        assert_eq!(f.refresher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthenticated_then_success_after_refresh() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        f.session.set_credential(credential_for("stale"));
        let call = ScriptedCall::new(vec![Err(unauthenticated()), Ok(1)]);

        assert_eq!(f.classifier.classify(|| call.call()).await.unwrap(), 1);
        assert_eq!(call.calls(), 2);
        assert_eq!(f.refresher.calls(), 1);
        assert_eq!(f.session.subject_id().as_deref(), Some("fresh"));
        assert!(f.alerts.messages().is_empty());
        assert!(f.navigator.paths().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_credential_redirects_after_failed_refresh() {
        let f = fixture(CountingRefresher::failing(AuthError::Unauthenticated));
        let call = ScriptedCall::new(vec![Err(unauthenticated())]);

        let err = f.classifier.classify(|| call.call()).await.unwrap_err();

        assert!(err.is_redirect());
        assert_eq!(call.calls(), 1);
        assert!(f.alerts.messages().is_empty());
        // Already logged out, so the redirect is a no-op.
        assert!(f.navigator.paths().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_refresh_redirects_once() {
        let f = fixture(CountingRefresher::failing(AuthError::Unauthenticated));
        f.session.set_credential(credential_for("u1"));
        let call = ScriptedCall::new(vec![Err(unauthenticated())]);

        let err = f.classifier.classify(|| call.call()).await.unwrap_err();

        assert!(err.is_redirect());
        assert!(!f.session.is_authenticated());
        assert_eq!(f.navigator.paths(), vec![LOGOUT_PATH.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_refresh_failure_redirects() {
        let f = fixture(CountingRefresher::failing(AuthError::Transient("503".into())));
        f.session.set_credential(credential_for("u1"));
        let call = ScriptedCall::new(vec![Err(unauthenticated())]);

        let err = f.classifier.classify(|| call.call()).await.unwrap_err();

        assert!(err.is_redirect());
        assert!(!f.session.is_authenticated());
        assert_eq!(f.navigator.paths(), vec![LOGOUT_PATH.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_rejected_again_redirects() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        f.session.set_credential(credential_for("stale"));
        let call = ScriptedCall::new(vec![Err(unauthenticated()), Err(unauthenticated())]);

        let err = f.classifier.classify(|| call.call()).await.unwrap_err();

        assert!(err.is_redirect());
        assert_eq!(call.calls(), 2);
        assert_eq!(f.refresher.calls(), 1);
        assert_eq!(f.navigator.paths(), vec![LOGOUT_PATH.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_other_failure_is_classified_normally() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        f.session.set_credential(credential_for("stale"));
        let call = ScriptedCall::new(vec![
            Err(unauthenticated()),
            Err(remote(Code::PermissionDenied, "not yours")),
        ]);

        let err = f.classifier.classify(|| call.call()).await.unwrap_err();

        assert_eq!(
            err.class,
            ErrorClass::UserAlert("permission_denied: not yours".to_string())
        );
        assert_eq!(f.alerts.messages(), vec!["permission_denied: not yours"]);
        assert!(f.session.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_email_not_verified_alerts_fixed_message() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        let call = ScriptedCall::new(vec![Err(email_not_verified())]);

        let err = f.classifier.classify(|| call.call()).await.unwrap_err();

        let expected = "You must verify your email before logging in";
        assert_eq!(err.class, ErrorClass::UserAlert(expected.to_string()));
        assert_eq!(f.alerts.messages(), vec![expected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_codes_are_silent() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        let call = ScriptedCall::new(vec![
            Err(remote(Code::Unavailable, "down")),
            Err(remote(Code::Canceled, "navigated away")),
        ]);

        for _ in 0..2 {
            let err = f.classifier.classify(|| call.call()).await.unwrap_err();
            assert_eq!(err.class, ErrorClass::Ignored);
        }
        assert!(f.alerts.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_ignore_list() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        let classifier = f.classifier.with_ignored([Code::NotFound]);
        let call = ScriptedCall::new(vec![
            Err(remote(Code::NotFound, "gone")),
            Err(remote(Code::Unavailable, "down")),
        ]);

        let first = classifier.classify(|| call.call()).await.unwrap_err();
        assert_eq!(first.class, ErrorClass::Ignored);
        let second = classifier.classify(|| call.call()).await.unwrap_err();
        assert_eq!(second.class, ErrorClass::UserAlert("unavailable: down".to_string()));
        assert_eq!(f.alerts.messages(), vec!["unavailable: down"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_remote_failure_is_transient_and_silent() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        let call = ScriptedCall::new(vec![Err(ApiError::InvalidResponse("truncated".into()))]);

        let err = f.classifier.classify(|| call.call()).await.unwrap_err();

        assert_eq!(err.class, ErrorClass::RetryableTransient);
        assert!(f.alerts.messages().is_empty());
        assert_eq!(f.refresher.calls(), 0);
    }
}
