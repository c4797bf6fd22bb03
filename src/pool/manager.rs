//! Spawn-on-demand and coordinated shutdown of workers.

use super::helper::HelperLauncher;
use super::shared::{SharedState, StopMode};
use super::worker::{ExitReason, Worker, WorkerExit, WorkerTimings};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::progress::ProgressSink;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How often shutdown logs which workers it is still waiting for.
const SHUTDOWN_REPORT_INTERVAL: Duration = Duration::from_secs(1);

struct WorkerHandle {
    id: usize,
    pid: Option<u32>,
    handle: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    fn join(self) -> WorkerExit {
        match self.handle.join() {
            Ok(exit) => exit,
            Err(_) => {
                warn!(worker_id = self.id, "Worker thread panicked");
                WorkerExit {
                    worker_id: self.id,
                    reason: ExitReason::HelperLost("worker thread panicked".into()),
                    items_processed: 0,
                }
            }
        }
    }
}

/// Outcome of [`PoolManager::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub mode: StopMode,
    /// Every worker that ran since the last shutdown, in join order.
    pub exits: Vec<WorkerExit>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn workers(&self) -> usize {
        self.exits.len()
    }

    pub fn items_processed(&self) -> u64 {
        self.exits.iter().map(|e| e.items_processed).sum()
    }

    /// Workers that terminated with an item in hand.
    pub fn items_lost(&self) -> usize {
        self.exits.iter().filter(|e| e.reason.lost_item()).count()
    }

    pub fn idle_timeouts(&self) -> usize {
        self.exits
            .iter()
            .filter(|e| e.reason == ExitReason::IdleTimeout)
            .count()
    }
}

/// Owns the worker roster and decides when to grow it.
pub struct PoolManager {
    shared: Arc<SharedState>,
    launcher: Arc<dyn HelperLauncher>,
    config: PoolConfig,
    progress: ProgressSink,
    roster: Vec<WorkerHandle>,
    /// Workers pruned from the roster before shutdown.
    exited: Vec<WorkerExit>,
    next_id: usize,
}

impl PoolManager {
    /// Create a manager and prestart `config.active_worker_count` workers.
    pub fn new(
        shared: Arc<SharedState>,
        launcher: Arc<dyn HelperLauncher>,
        config: PoolConfig,
        progress: ProgressSink,
    ) -> Result<Self> {
        config.validate()?;
        let mut manager = Self {
            shared,
            launcher,
            config,
            progress,
            roster: Vec::new(),
            exited: Vec::new(),
            next_id: 0,
        };
        let prestart = manager.config.active_worker_count;
        manager.ensure_workers(prestart)?;
        info!(
            workers = prestart,
            helpers = %manager.launcher.describe(),
            "Helper pool started"
        );
        Ok(manager)
    }

    /// Make sure at least `n` workers are idle, spawning the shortfall.
    ///
    /// Returns how many workers were spawned. Each spawned worker is
    /// registered as idle before its thread starts, so back-to-back calls
    /// never over-provision.
    #[instrument(level = "debug", skip(self))]
    pub fn ensure_workers(&mut self, n: usize) -> Result<usize> {
        self.prune_exited();
        if !self.shared.is_running() {
            debug!("Stop requested; not spawning workers");
            return Ok(0);
        }

        let idle = self.shared.census.idle();
        let needed = n.saturating_sub(idle);
        for _ in 0..needed {
            self.spawn_worker()?;
        }
        if needed > 0 {
            debug!(spawned = needed, idle, "Spawned workers");
        }
        Ok(needed)
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;

        let helper = self.launcher.launch(id)?;
        let pid = helper.pid();
        let timings = WorkerTimings {
            idle_timeout: self.config.helper_timeout,
            poll_interval: self.config.poll_interval,
        };

        self.shared.census.enlist();
        let worker = Worker::new(
            id,
            self.shared.clone(),
            helper,
            timings,
            self.progress.clone(),
        );
        match worker.spawn() {
            Ok(handle) => {
                self.roster.push(WorkerHandle { id, pid, handle });
                Ok(())
            }
            Err(e) => {
                self.shared.census.retire_idle();
                Err(PoolError::Spawn(format!(
                    "Failed to start worker thread {}: {}",
                    id, e
                )))
            }
        }
    }

    /// Join workers whose threads have already finished.
    fn prune_exited(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.roster)
            .into_iter()
            .partition(|w| w.handle.is_finished());
        self.roster = running;
        for worker in finished {
            let exit = worker.join();
            debug!(worker_id = exit.worker_id, reason = %exit.reason, "Pruned worker");
            self.exited.push(exit);
        }
    }

    /// Stop every worker and wait until each one has exited.
    #[instrument(level = "debug", skip(self))]
    pub fn shutdown(&mut self, mode: StopMode) -> ShutdownReport {
        let start = Instant::now();
        self.shared.request_stop(mode);

        let mut exits = std::mem::take(&mut self.exited);
        let mut last_report = Instant::now();
        for worker in std::mem::take(&mut self.roster) {
            while !worker.handle.is_finished() {
                if last_report.elapsed() >= SHUTDOWN_REPORT_INTERVAL {
                    debug!(worker_id = worker.id, pid = ?worker.pid, "Waiting for worker");
                    last_report = Instant::now();
                }
                thread::sleep(self.config.poll_interval);
            }
            exits.push(worker.join());
        }

        let report = ShutdownReport {
            mode,
            exits,
            elapsed: start.elapsed(),
        };
        info!(
            mode = %mode,
            workers = report.workers(),
            items = report.items_processed(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Helper pool stopped"
        );
        report
    }

    /// Workers still on the roster (including ones about to exit).
    pub fn roster_len(&self) -> usize {
        self.roster.len()
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn describe(&self) -> String {
        self.launcher.describe()
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        if !self.roster.is_empty() {
            self.shutdown(StopMode::Forced);
        }
    }
}
