//! Hooks into the frontend: navigation and user-visible alerts.

/// Route the frontend shows after the session is torn down.
pub const LOGOUT_PATH: &str = "/logout";

pub trait Navigator: Send + Sync {
    fn navigate_to(&self, path: &str);
}

pub trait AlertSink: Send + Sync {
    fn alert(&self, message: &str);
}
