//! Coordination state shared by the dispatcher, the pool manager and workers.
//!
//! Each resource has exactly one guard of its own:
//!
//! | resource            | guard                                     |
//! |---------------------|-------------------------------------------|
//! | input queue         | `crossbeam` channel + input traffic gate  |
//! | output queue        | `crossbeam` channel + output traffic gate |
//! | worker census       | `Mutex<CensusCounts>`                     |
//! | termination signal  | `AtomicU8` + signal traffic gate          |
//! | progress counters   | atomics                                   |
//!
//! Guards are held only for the get/put/read/write itself. The single
//! exception is [`SharedState::pause_traffic`], which takes all three
//! traffic gates at once.

use crate::frame::Frame;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// A tagged unit of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub batch: u64,
    pub sequence_id: usize,
    pub frame: Frame,
}

/// The tagged output of one [`WorkItem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultItem {
    pub batch: u64,
    pub sequence_id: usize,
    pub frame: Frame,
}

/// How the pool should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopMode {
    /// Finish the item in hand, then exit.
    Graceful,
    /// Abandon in-flight work and exit within one polling interval.
    Forced,
}

impl std::fmt::Display for StopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graceful => f.write_str("graceful"),
            Self::Forced => f.write_str("forced"),
        }
    }
}

/// Tri-state termination flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Running,
    GracefulStop,
    ForcedStop,
}

impl Termination {
    /// `None` while running.
    pub fn stop_mode(self) -> Option<StopMode> {
        match self {
            Self::Running => None,
            Self::GracefulStop => Some(StopMode::Graceful),
            Self::ForcedStop => Some(StopMode::Forced),
        }
    }
}

const RUNNING: u8 = 0;
const GRACEFUL: u8 = 1;
const FORCED: u8 = 2;

/// Idle and live worker counts, always read and written together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CensusCounts {
    pub idle: usize,
    pub live: usize,
}

/// Worker census. Invariant: `idle <= live`.
#[derive(Debug, Default)]
pub struct WorkerCensus {
    counts: Mutex<CensusCounts>,
}

impl WorkerCensus {
    fn lock(&self) -> MutexGuard<'_, CensusCounts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A new worker registers itself as live and idle.
    pub fn enlist(&self) {
        let mut c = self.lock();
        c.live += 1;
        c.idle += 1;
    }

    /// An idle worker claimed an item.
    pub fn claim(&self) {
        let mut c = self.lock();
        debug_assert!(c.idle > 0, "claim with no idle worker registered");
        c.idle = c.idle.saturating_sub(1);
    }

    /// A busy worker returned to idle.
    pub fn release(&self) {
        let mut c = self.lock();
        debug_assert!(c.idle < c.live, "release would exceed live workers");
        c.idle = (c.idle + 1).min(c.live);
    }

    /// An idle worker terminated.
    pub fn retire_idle(&self) {
        let mut c = self.lock();
        debug_assert!(c.idle > 0 && c.live > 0);
        c.idle = c.idle.saturating_sub(1);
        c.live = c.live.saturating_sub(1);
    }

    /// A busy worker terminated (its idle slot was already given up at claim).
    pub fn retire_busy(&self) {
        let mut c = self.lock();
        debug_assert!(c.live > c.idle);
        c.live = c.live.saturating_sub(1);
    }

    /// Retire an idle worker only if `allow` holds, evaluated inside the
    /// census critical section.
    pub fn retire_idle_if(&self, allow: impl FnOnce() -> bool) -> bool {
        let mut c = self.lock();
        if !allow() {
            return false;
        }
        c.idle = c.idle.saturating_sub(1);
        c.live = c.live.saturating_sub(1);
        true
    }

    pub fn idle(&self) -> usize {
        self.lock().idle
    }

    pub fn live(&self) -> usize {
        self.lock().live
    }

    pub fn snapshot(&self) -> CensusCounts {
        *self.lock()
    }
}

/// Monotonic progress counters.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl ProgressCounters {
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct TrafficGates {
    input: RwLock<()>,
    output: RwLock<()>,
    signal: RwLock<()>,
}

fn read_gate(gate: &RwLock<()>) -> RwLockReadGuard<'_, ()> {
    gate.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_gate(gate: &RwLock<()>) -> RwLockWriteGuard<'_, ()> {
    gate.write().unwrap_or_else(PoisonError::into_inner)
}

/// Holds every traffic gate; all queue and signal traffic blocks until dropped.
pub struct TrafficPause<'a> {
    _input: RwLockWriteGuard<'a, ()>,
    _output: RwLockWriteGuard<'a, ()>,
    _signal: RwLockWriteGuard<'a, ()>,
}

/// All state shared between the controller and its workers.
///
/// Both ends of every queue stay owned here, so channel operations never
/// observe a disconnect while the state is alive.
#[derive(Debug)]
pub struct SharedState {
    input_tx: Sender<WorkItem>,
    input_rx: Receiver<WorkItem>,
    output_tx: Sender<ResultItem>,
    output_rx: Receiver<ResultItem>,
    termination: AtomicU8,
    gates: TrafficGates,
    pub census: WorkerCensus,
    pub progress: ProgressCounters,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        let (input_tx, input_rx) = unbounded();
        let (output_tx, output_rx) = unbounded();
        Self {
            input_tx,
            input_rx,
            output_tx,
            output_rx,
            termination: AtomicU8::new(RUNNING),
            gates: TrafficGates::default(),
            census: WorkerCensus::default(),
            progress: ProgressCounters::default(),
        }
    }

    /// Put an item on the input queue.
    pub fn enqueue(&self, item: WorkItem) {
        let _gate = read_gate(&self.gates.input);
        // Cannot fail: `self` owns a receiver.
        let _ = self.input_tx.send(item);
    }

    /// Wait up to `timeout` for an item and claim it for the calling worker.
    ///
    /// The channel receive is the indivisible check-and-dequeue, so no item
    /// is handed to two workers. The input gate is held across the dequeue
    /// and the census update, so a paused observer never sees an item gone
    /// from the queue while its claimant still counts as idle.
    pub fn claim(&self, timeout: Duration) -> Option<WorkItem> {
        let _gate = read_gate(&self.gates.input);
        let item = match self.input_rx.recv_timeout(timeout) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
        };
        self.census.claim();
        Some(item)
    }

    /// Whether the input queue currently holds no items.
    pub fn input_is_empty(&self) -> bool {
        self.input_rx.is_empty()
    }

    /// Items waiting to be claimed.
    pub fn queued(&self) -> usize {
        self.input_rx.len()
    }

    /// Remove every unclaimed item, returning how many were dropped.
    pub fn drain_input(&self) -> usize {
        let _gate = read_gate(&self.gates.input);
        self.input_rx.try_iter().count()
    }

    /// Put a finished result on the output queue.
    pub fn publish(&self, result: ResultItem) {
        let _gate = read_gate(&self.gates.output);
        let _ = self.output_tx.send(result);
    }

    /// Wait up to `timeout` for the next result.
    pub fn receive(&self, timeout: Duration) -> Option<ResultItem> {
        let _gate = read_gate(&self.gates.output);
        self.output_rx.recv_timeout(timeout).ok()
    }

    /// Take a result if one is ready.
    pub fn try_receive(&self) -> Option<ResultItem> {
        let _gate = read_gate(&self.gates.output);
        self.output_rx.try_recv().ok()
    }

    /// Current value of the termination flag.
    pub fn termination(&self) -> Termination {
        match self.termination.load(Ordering::Acquire) {
            RUNNING => Termination::Running,
            GRACEFUL => Termination::GracefulStop,
            _ => Termination::ForcedStop,
        }
    }

    /// `Some(mode)` once a stop has been requested.
    pub fn stop_mode(&self) -> Option<StopMode> {
        self.termination().stop_mode()
    }

    pub fn is_running(&self) -> bool {
        self.termination() == Termination::Running
    }

    /// Request a stop. A forced stop is never downgraded to graceful.
    pub fn request_stop(&self, mode: StopMode) {
        let _gate = read_gate(&self.gates.signal);
        let value = match mode {
            StopMode::Graceful => GRACEFUL,
            StopMode::Forced => FORCED,
        };
        self.termination.fetch_max(value, Ordering::AcqRel);
    }

    /// Block all enqueue, claim, publish, receive and stop-request traffic.
    ///
    /// Gates are taken in a fixed order (input, output, signal). This is the
    /// only place more than one guard is held at a time. A claim or receive
    /// already waiting on its queue holds its gate until it returns, so the
    /// pause can take up to that call's timeout to begin.
    pub fn pause_traffic(&self) -> TrafficPause<'_> {
        TrafficPause {
            _input: write_gate(&self.gates.input),
            _output: write_gate(&self.gates.output),
            _signal: write_gate(&self.gates.signal),
        }
    }
}
