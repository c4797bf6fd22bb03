//! The seam between a worker and the engine that performs its analysis.
//!
//! A [`Helper`] is handed to a worker at spawn time and is the worker's only
//! route to the analysis collaborator: `submit` sends one item, `poll`
//! picks up its result. Launchers decide what a helper is: a separate OS
//! process ([`super::ProcessLauncher`]) or a thread in the current process
//! ([`super::ThreadLauncher`]).

use super::shared::{ResultItem, WorkItem};
use crate::error::Result;
use std::time::Duration;

/// One analysis engine, driven by exactly one worker.
pub trait Helper: Send {
    /// Hand an item to the helper. At most one item is in flight at a time.
    fn submit(&mut self, item: WorkItem) -> Result<()>;

    /// Wait up to `timeout` for the result of the submitted item.
    ///
    /// `Ok(None)` means nothing arrived yet. An error means the item is lost:
    /// either the analysis failed or the helper itself is gone.
    fn poll(&mut self, timeout: Duration) -> Result<Option<ResultItem>>;

    /// Shut the helper down. `forced` skips any exit handshake.
    fn stop(&mut self, forced: bool);

    /// OS process id, for process-backed helpers.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Creates helpers on demand.
pub trait HelperLauncher: Send + Sync {
    /// Start a fresh helper for worker `worker_id`.
    ///
    /// Returns only once the helper is ready to accept work.
    fn launch(&self, worker_id: usize) -> Result<Box<dyn Helper>>;

    /// Short name for logs.
    fn describe(&self) -> String;
}
