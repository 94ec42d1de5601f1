//! Progress reporting for harvest and processing runs.
//!
//! The harvest and processing loops report through [`ProgressCallback`]
//! and never know how (or whether) the progress is rendered. The CLI
//! provides `indicatif` bars; tests and library callers use
//! [`NullProgress`].

use std::sync::Arc;

/// Receives progress updates. Shared across tasks, hence `Send + Sync`.
pub trait ProgressCallback: Send + Sync {
    /// Sets the expected total (enables percentage and ETA).
    fn set_total(&self, total: u64);

    /// Advances by `delta` records.
    fn inc(&self, delta: u64);

    /// Replaces the message shown next to the indicator.
    fn set_message(&self, msg: String);

    /// Marks the work complete with a final message.
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

/// Returns a shared [`NullProgress`].
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
