//! Progress reporting.

use crate::error::SyncError;

/// The phase of a pass that makes progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Pulling changes from the server.
    Downloading,
    /// Pushing local edits to the server.
    Uploading,
}

/// A progress event of a sync pass.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncProgress {
    /// The pass started.
    Started,
    /// Records were processed.
    InProgress {
        /// Current phase.
        phase: SyncPhase,
        /// Records processed in this phase so far.
        completed: u64,
        /// Records expected in this phase, if known.
        total: Option<u64>,
    },
    /// The pass finished without failures.
    Succeeded,
    /// The pass finished with a failure, was cancelled, or aborted.
    Failed(SyncError),
}

/// Receives progress events.
///
/// Called synchronously on the thread running the pass; implementations
/// should return quickly.
pub trait SyncObserver: Send + Sync {
    /// Handles one event.
    fn on_progress(&self, progress: &SyncProgress);
}

impl<F> SyncObserver for F
where
    F: Fn(&SyncProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &SyncProgress) {
        self(progress)
    }
}
