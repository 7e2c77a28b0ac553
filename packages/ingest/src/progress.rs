//! Progress reporting for window syncs.
//!
//! The engine reports per-resource progress through [`ProgressCallback`]
//! and leaves rendering to the caller. The binary draws `indicatif` bars;
//! tests pass [`null_progress`].

use std::sync::Arc;

/// Receives progress updates while a window is synced.
pub trait ProgressCallback: Send + Sync {
    /// Number of resources the window will visit.
    fn set_total(&self, total: u64);

    /// Advance by `delta` resources.
    fn inc(&self, delta: u64);

    /// Replace the message shown next to the indicator.
    fn set_message(&self, msg: String);

    /// The window finished; show `msg` as its final line.
    fn finish(&self, msg: String);
}

/// Ignores every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// A shared [`NullProgress`].
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
