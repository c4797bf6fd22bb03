//! The worker state machine.
//!
//! ```text
//!            claim               result published
//!   Idle ─────────────▶ Processing ─────────────▶ Idle
//!    │                      │
//!    │ idle timeout         │ analysis failure, helper lost,
//!    │ or stop requested    │ or forced stop
//!    ▼                      ▼
//!   Terminating ◀───────────┘
//! ```
//!
//! A worker is registered in the census (idle + 1, live + 1) by the pool
//! manager before its thread starts, and deregisters exactly once on its way
//! out: from Idle it gives up both its idle and live slot, from Processing
//! only its live slot (the idle slot went away at claim time).

use super::helper::Helper;
use super::shared::{ResultItem, SharedState, StopMode, Termination, WorkItem};
use crate::error::{PoolError, Result};
use crate::progress::ProgressSink;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Where a worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Processing,
    Terminating,
}

/// Why a worker terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Sat idle for the helper timeout with nothing queued.
    IdleTimeout,
    /// Observed a stop request.
    Stopped(StopMode),
    /// The helper reported an analysis error; the item was dropped.
    AnalysisFailed(String),
    /// The helper went away mid-item; the item was dropped.
    HelperLost(String),
}

impl ExitReason {
    /// Whether the worker took an item down with it.
    pub fn lost_item(&self) -> bool {
        matches!(self, Self::AnalysisFailed(_) | Self::HelperLost(_))
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::Stopped(mode) => write!(f, "{} stop", mode),
            Self::AnalysisFailed(msg) => write!(f, "analysis failed: {}", msg),
            Self::HelperLost(msg) => write!(f, "helper lost: {}", msg),
        }
    }
}

/// What a joined worker thread returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker_id: usize,
    pub reason: ExitReason,
    pub items_processed: u64,
}

/// Timing knobs a worker needs.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTimings {
    /// Idle time after which the worker retires.
    pub idle_timeout: Duration,
    /// Upper bound on any single wait.
    pub poll_interval: Duration,
}

enum Outcome {
    Done(ResultItem),
    /// Forced stop arrived while the helper was busy.
    Abandoned,
}

pub(crate) struct Worker {
    id: usize,
    shared: Arc<SharedState>,
    helper: Box<dyn Helper>,
    timings: WorkerTimings,
    progress: ProgressSink,
    state: WorkerState,
    processed: u64,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        shared: Arc<SharedState>,
        helper: Box<dyn Helper>,
        timings: WorkerTimings,
        progress: ProgressSink,
    ) -> Self {
        Self {
            id,
            shared,
            helper,
            timings,
            progress,
            state: WorkerState::Idle,
            processed: 0,
        }
    }

    /// Start the worker on its own thread. The census entry must already
    /// exist.
    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<WorkerExit>> {
        thread::Builder::new()
            .name(format!("worker-{}", self.id))
            .spawn(move || self.run())
    }

    /// Run until termination.
    pub(crate) fn run(mut self) -> WorkerExit {
        debug!(worker_id = self.id, pid = ?self.helper.pid(), "Worker started");
        let reason = self.run_loop();
        self.transition(WorkerState::Terminating);

        let forced = matches!(reason, ExitReason::Stopped(StopMode::Forced));
        self.helper.stop(forced);

        if reason.lost_item() {
            warn!(worker_id = self.id, reason = %reason, "Worker terminated");
        } else {
            debug!(
                worker_id = self.id,
                reason = %reason,
                items = self.processed,
                "Worker terminated"
            );
        }
        WorkerExit {
            worker_id: self.id,
            reason,
            items_processed: self.processed,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        trace!(worker_id = self.id, from = ?self.state, to = ?next, "Worker state");
        self.state = next;
    }

    fn run_loop(&mut self) -> ExitReason {
        let mut idle_since = Instant::now();
        loop {
            if let Some(mode) = self.shared.stop_mode() {
                self.shared.census.retire_idle();
                return ExitReason::Stopped(mode);
            }

            let idle_for = idle_since.elapsed();
            if idle_for >= self.timings.idle_timeout {
                let shared = &self.shared;
                if shared.census.retire_idle_if(|| shared.input_is_empty()) {
                    return ExitReason::IdleTimeout;
                }
            }

            let wait = self
                .timings
                .poll_interval
                .min(self.timings.idle_timeout.saturating_sub(idle_for));
            let Some(item) = self.shared.claim(wait) else {
                continue;
            };

            self.transition(WorkerState::Processing);
            match self.process(item) {
                Ok(Outcome::Done(result)) => {
                    self.shared.census.release();
                    self.shared.publish(result);
                    self.shared.progress.record_processed();
                    self.progress.advanced(1);
                    self.processed += 1;
                    self.transition(WorkerState::Idle);
                    idle_since = Instant::now();
                }
                Ok(Outcome::Abandoned) => {
                    self.shared.census.retire_busy();
                    return ExitReason::Stopped(StopMode::Forced);
                }
                Err(e) => {
                    self.shared.census.retire_busy();
                    self.shared.progress.record_failed();
                    return match e {
                        PoolError::Analysis { .. } => ExitReason::AnalysisFailed(e.to_string()),
                        other => ExitReason::HelperLost(other.to_string()),
                    };
                }
            }
        }
    }

    /// Hand one item to the helper and wait for its result in polling
    /// slices, watching for a forced stop between slices.
    fn process(&mut self, item: WorkItem) -> Result<Outcome> {
        let (batch, sequence_id) = (item.batch, item.sequence_id);
        trace!(worker_id = self.id, batch, sequence_id, "Claimed item");
        self.helper.submit(item)?;

        loop {
            if self.shared.termination() == Termination::ForcedStop {
                return Ok(Outcome::Abandoned);
            }
            let Some(result) = self.helper.poll(self.timings.poll_interval)? else {
                continue;
            };
            if result.batch != batch || result.sequence_id != sequence_id {
                return Err(PoolError::Helper(format!(
                    "expected result for item {} of batch {}, got item {} of batch {}",
                    sequence_id, batch, result.sequence_id, result.batch
                )));
            }
            return Ok(Outcome::Done(result));
        }
    }
}
