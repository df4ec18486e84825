//! Fire-and-forget analytics events.
//!
//! The client emits small named events (`pair.success`, `sign.timeout`, ...)
//! through this trait. Implementations must return quickly and may not fail
//! loudly; nothing here is allowed on the blocking request path.

pub trait Tracker: Send + Sync {
    fn event(&self, name: &str);
}

/// Drops every event. The default collaborator.
pub struct NullTracker;

impl Tracker for NullTracker {
    fn event(&self, _name: &str) {}
}
