//! Progress reporting for sync runs.
//!
//! The CLI renders these updates as a progress bar. Library callers and
//! tests pass `None` and get [`NullProgress`].

use std::sync::Arc;

/// Receives progress updates from [`sync_report`](crate::sync_report).
///
/// The unit of work is one code window. Every method defaults to doing
/// nothing.
pub trait ProgressCallback: Send + Sync {
    /// Called once branches are resolved, with the number of code windows.
    fn set_total(&self, _windows: u64) {}

    /// Names the chunk being downloaded.
    fn set_message(&self, _msg: String) {}

    /// `delta` more windows are done.
    fn inc(&self, _delta: u64) {}

    /// The run is over; `msg` summarizes it.
    fn finish(&self, _msg: String) {}
}

/// Discards every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {}

/// A shared [`NullProgress`], used when the caller passes no progress.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
