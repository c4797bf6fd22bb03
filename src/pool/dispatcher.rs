//! Batch dispatch and ordered collection.
//!
//! The dispatcher tags every frame of a batch with its position, lets the
//! pool process them in any order, and hands the outputs back in input
//! order.

use super::helper::HelperLauncher;
use super::manager::{PoolManager, ShutdownReport};
use super::shared::{ResultItem, SharedState, StopMode, Termination, WorkItem};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::frame::Frame;
use crate::progress::ProgressSink;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// Sends batches to the helper pool and collects their results.
pub struct Dispatcher {
    shared: Arc<SharedState>,
    manager: PoolManager,
    config: PoolConfig,
    progress: ProgressSink,
    /// Number of the most recently sent batch.
    batch: u64,
    /// Results still owed for the current batch.
    pending: usize,
    collected: Vec<ResultItem>,
}

impl Dispatcher {
    /// Start a helper pool and a dispatcher in front of it.
    pub fn new(
        config: PoolConfig,
        launcher: Arc<dyn HelperLauncher>,
        progress: ProgressSink,
    ) -> Result<Self> {
        let shared = Arc::new(SharedState::new());
        let manager = PoolManager::new(
            shared.clone(),
            launcher,
            config.clone(),
            progress.clone(),
        )?;
        Ok(Self {
            shared,
            manager,
            config,
            progress,
            batch: 0,
            pending: 0,
            collected: Vec::new(),
        })
    }

    /// Enqueue one frame per item, tagged with its input position.
    ///
    /// Returns the batch number. The previous batch must have been collected
    /// (or abandoned) first.
    #[instrument(level = "debug", skip_all, fields(items = frames.len()))]
    pub fn send_batch(&mut self, frames: Vec<Frame>) -> Result<u64> {
        if self.pending > 0 {
            return Err(PoolError::BatchInFlight {
                pending: self.pending,
            });
        }
        if !self.shared.is_running() {
            return Err(PoolError::Cancelled);
        }

        self.batch += 1;
        self.collected.clear();
        let batch = self.batch;
        let size = frames.len();
        for (sequence_id, frame) in frames.into_iter().enumerate() {
            self.shared.enqueue(WorkItem {
                batch,
                sequence_id,
                frame,
            });
        }
        self.pending = size;
        self.progress.batch_started(batch, size);

        let spawned = match self.manager.ensure_workers(size) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.abandon("helper spawn failed");
                return Err(e);
            }
        };
        debug!(batch, size, spawned, "Batch dispatched");
        Ok(batch)
    }

    /// Wait for every result of the current batch and return the outputs in
    /// input order.
    ///
    /// On cancellation or timeout the batch is abandoned: outstanding items
    /// are dropped from the queue and late results are ignored.
    #[instrument(level = "debug", skip(self), fields(batch = self.batch))]
    pub fn collect_batch(&mut self) -> Result<Vec<Frame>> {
        let start = Instant::now();
        while self.pending > 0 {
            if self.shared.termination() == Termination::ForcedStop {
                self.abandon("forced stop");
                return Err(PoolError::Cancelled);
            }

            let waited = start.elapsed();
            if waited >= self.config.collect_deadline {
                let pending = self.pending;
                self.abandon("deadline passed");
                return Err(PoolError::DispatchTimeout { pending, waited });
            }

            let wait = self
                .config
                .poll_interval
                .min(self.config.collect_deadline - waited);
            match self.shared.receive(wait) {
                Some(result) => self.accept(result),
                None => {
                    let stopping = self.shared.termination() == Termination::GracefulStop;
                    if stopping && self.shared.census.live() == 0 && !self.take_remaining() {
                        self.abandon("no workers left");
                        return Err(PoolError::Cancelled);
                    }
                }
            }
        }

        let mut results = std::mem::take(&mut self.collected);
        results.sort_unstable_by_key(|r| r.sequence_id);
        Ok(results.into_iter().map(|r| r.frame).collect())
    }

    /// [`send_batch`](Self::send_batch) followed by
    /// [`collect_batch`](Self::collect_batch).
    pub fn process_batch(&mut self, frames: Vec<Frame>) -> Result<Vec<Frame>> {
        self.send_batch(frames)?;
        self.collect_batch()
    }

    fn accept(&mut self, result: ResultItem) {
        if result.batch != self.batch {
            trace!(
                stale_batch = result.batch,
                sequence_id = result.sequence_id,
                "Discarding stale result"
            );
            return;
        }
        self.pending -= 1;
        self.collected.push(result);
        self.progress.remaining(self.pending);
    }

    /// Accept every result already on the output queue. Returns whether
    /// the batch is complete.
    ///
    /// Workers publish before they retire, so once none are live this sees
    /// everything they delivered.
    fn take_remaining(&mut self) -> bool {
        while self.pending > 0
            && let Some(result) = self.shared.try_receive()
        {
            self.accept(result);
        }
        self.pending == 0
    }

    fn abandon(&mut self, why: &str) {
        let dropped = self.shared.drain_input();
        warn!(
            batch = self.batch,
            pending = self.pending,
            dropped,
            reason = why,
            "Abandoning batch"
        );
        self.pending = 0;
        self.collected.clear();
    }

    /// Results still owed for the current batch.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Number of the most recently sent batch (0 before the first).
    pub fn current_batch(&self) -> u64 {
        self.batch
    }

    /// Shared state, for requesting a stop from another thread.
    pub fn shared(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    pub fn manager(&self) -> &PoolManager {
        &self.manager
    }

    pub fn request_stop(&self, mode: StopMode) {
        self.shared.request_stop(mode);
    }

    /// Stop the pool and wait for every worker.
    pub fn shutdown(&mut self, mode: StopMode) -> ShutdownReport {
        self.manager.shutdown(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisSpec, AnalyzerKind};
    use crate::pool::helper::Helper;
    use crate::pool::local::ThreadLauncher;
    use crate::pool::shared::CensusCounts;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn config(workers: usize) -> PoolConfig {
        PoolConfig {
            helper_timeout: Duration::from_secs(30),
            active_worker_count: workers,
            poll_interval: Duration::from_millis(10),
            collect_deadline: Duration::from_secs(10),
            helper_stop_timeout: Duration::from_millis(200),
        }
    }

    fn dispatcher(workers: usize, launcher: ThreadLauncher) -> Dispatcher {
        Dispatcher::new(config(workers), Arc::new(launcher), ProgressSink::disabled()).unwrap()
    }

    fn frame(bytes: &[u8]) -> Frame {
        Frame::new(bytes.len() as u32, 1, 1, bytes.to_vec()).unwrap()
    }

    /// Analyzer that sleeps for `data[0]` milliseconds, so later items can
    /// finish first.
    fn sleepy() -> ThreadLauncher {
        ThreadLauncher::from_fn(|_| {
            |f: Frame| -> crate::error::Result<Frame> {
                thread::sleep(Duration::from_millis(f.data[0] as u64));
                Ok(f)
            }
        })
    }

    #[test]
    fn test_roundtrip_with_reverse() {
        let mut d = dispatcher(2, ThreadLauncher::new(AnalysisSpec::new(AnalyzerKind::Reverse)));
        let out = d
            .process_batch(vec![frame(&[1, 2, 3]), frame(&[4, 5]), frame(&[6])])
            .unwrap();
        let data: Vec<_> = out.into_iter().map(|f| f.data).collect();
        assert_eq!(data, vec![vec![3, 2, 1], vec![5, 4], vec![6]]);
        assert_eq!(d.pending(), 0);
        d.shutdown(StopMode::Graceful);
    }

    #[test]
    fn test_empty_batch() {
        let mut d = dispatcher(0, ThreadLauncher::new(AnalysisSpec::default()));
        assert!(d.process_batch(Vec::new()).unwrap().is_empty());
        assert_eq!(d.manager().roster_len(), 0);
        assert_eq!(d.current_batch(), 1);
    }

    #[test]
    fn test_out_of_order_completion_is_reordered() {
        let mut d = dispatcher(0, sleepy());
        // First item is slowest.
        let frames = vec![frame(&[120]), frame(&[60]), frame(&[0]), frame(&[30])];
        let out = d.process_batch(frames.clone()).unwrap();
        assert_eq!(out, frames);
        d.shutdown(StopMode::Graceful);
    }

    #[test]
    fn test_send_spawns_shortfall_only() {
        let mut d = dispatcher(2, ThreadLauncher::new(AnalysisSpec::default()));
        d.send_batch(vec![frame(&[0]); 5]).unwrap();
        // Prestarted workers may claim items before the idle count is read.
        let grown = d.manager().roster_len();
        assert!((5..=7).contains(&grown), "roster grew to {}", grown);
        d.collect_batch().unwrap();

        d.send_batch(vec![frame(&[0]); 3]).unwrap();
        d.collect_batch().unwrap();
        assert_eq!(d.manager().roster_len(), grown);
        d.shutdown(StopMode::Graceful);
    }

    #[test]
    fn test_batch_in_flight_rejected() {
        let mut d = dispatcher(1, sleepy());
        d.send_batch(vec![frame(&[50])]).unwrap();
        match d.send_batch(vec![frame(&[0])]) {
            Err(PoolError::BatchInFlight { pending }) => assert_eq!(pending, 1),
            other => panic!("Expected BatchInFlight, got {:?}", other),
        }
        assert_eq!(d.collect_batch().unwrap().len(), 1);
        d.shutdown(StopMode::Graceful);
    }

    #[test]
    fn test_send_after_stop_is_cancelled() {
        let mut d = dispatcher(1, ThreadLauncher::new(AnalysisSpec::default()));
        d.request_stop(StopMode::Graceful);
        assert!(matches!(
            d.send_batch(vec![frame(&[0])]),
            Err(PoolError::Cancelled)
        ));
    }

    #[test]
    fn test_forced_stop_cancels_collect() {
        let mut d = dispatcher(2, sleepy());
        d.send_batch(vec![frame(&[250]), frame(&[250])]).unwrap();
        let shared = d.shared();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            shared.request_stop(StopMode::Forced);
        });

        let started = Instant::now();
        assert!(matches!(d.collect_batch(), Err(PoolError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(d.pending(), 0);
        stopper.join().unwrap();

        let report = d.shutdown(StopMode::Forced);
        assert_eq!(report.items_processed(), 0);
    }

    #[test]
    fn test_graceful_stop_cancels_once_workers_gone() {
        let mut d = dispatcher(1, sleepy());
        let shared = d.shared();
        d.request_stop(StopMode::Graceful);
        let deadline = Instant::now() + Duration::from_secs(5);
        while shared.census.live() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(shared.census.live(), 0);

        // An item nobody is left to claim.
        d.batch = 1;
        d.pending = 1;
        shared.enqueue(WorkItem {
            batch: 1,
            sequence_id: 0,
            frame: frame(&[0]),
        });
        assert!(matches!(d.collect_batch(), Err(PoolError::Cancelled)));
        assert_eq!(d.pending(), 0);
        assert_eq!(shared.queued(), 0);
        d.shutdown(StopMode::Graceful);
    }

    #[test]
    fn test_graceful_stop_keeps_results_published_by_last_worker() {
        let mut d = dispatcher(0, ThreadLauncher::new(AnalysisSpec::default()));
        let shared = d.shared();
        d.request_stop(StopMode::Graceful);
        assert_eq!(shared.census.live(), 0);

        // Results the last worker published just before retiring.
        d.batch = 1;
        d.pending = 2;
        for (batch, sequence_id, byte) in [(1, 1, 11), (0, 0, 99), (1, 0, 10)] {
            shared.publish(ResultItem {
                batch,
                sequence_id,
                frame: frame(&[byte]),
            });
        }

        assert!(d.take_remaining());
        assert_eq!(d.pending(), 0);
        assert_eq!(d.collect_batch().unwrap(), vec![frame(&[10]), frame(&[11])]);
    }

    #[test]
    fn test_graceful_stop_after_claim_returns_result() {
        for _ in 0..20 {
            let mut d = dispatcher(1, sleepy());
            let shared = d.shared();
            d.send_batch(vec![frame(&[3])]).unwrap();
            while !shared.input_is_empty() {
                thread::sleep(Duration::from_millis(1));
            }

            // The worker holds the item; it finishes, publishes and retires.
            d.request_stop(StopMode::Graceful);
            assert_eq!(d.collect_batch().unwrap(), vec![frame(&[3])]);
            d.shutdown(StopMode::Graceful);
        }
    }

    /// Launches as many helpers as it has grants, then fails.
    struct RationedLauncher {
        inner: ThreadLauncher,
        grants: Arc<AtomicUsize>,
        launched: Arc<AtomicUsize>,
    }

    impl RationedLauncher {
        fn new(grants: usize) -> Self {
            Self {
                inner: sleepy(),
                grants: Arc::new(AtomicUsize::new(grants)),
                launched: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl HelperLauncher for RationedLauncher {
        fn launch(&self, worker_id: usize) -> Result<Box<dyn Helper>> {
            if self
                .grants
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
            {
                return Err(PoolError::Spawn("helper limit reached".into()));
            }
            self.launched.fetch_add(1, Ordering::SeqCst);
            self.inner.launch(worker_id)
        }

        fn describe(&self) -> String {
            "rationed".into()
        }
    }

    #[test]
    fn test_spawn_failure_abandons_batch() {
        let launcher = RationedLauncher::new(1);
        let grants = launcher.grants.clone();
        let mut d =
            Dispatcher::new(config(0), Arc::new(launcher), ProgressSink::disabled()).unwrap();
        let shared = d.shared();

        let err = d.send_batch(vec![frame(&[60]); 3]).unwrap_err();
        assert!(matches!(err, PoolError::Spawn(_)));
        assert_eq!(d.pending(), 0);
        assert_eq!(shared.queued(), 0);

        // Not stuck in flight: the next batch goes out, and the started
        // helper's late result for batch 1 is discarded.
        grants.store(4, Ordering::SeqCst);
        assert_eq!(d.process_batch(vec![frame(&[0, 1])]).unwrap(), vec![frame(&[0, 1])]);
        assert_eq!(d.current_batch(), 2);
        d.shutdown(StopMode::Graceful);
    }

    #[test]
    fn test_census_never_shows_more_idle_than_live() {
        let mut config = config(1);
        config.helper_timeout = Duration::from_millis(40);
        let launcher = RationedLauncher::new(usize::MAX);
        let launched = launcher.launched.clone();
        let mut d = Dispatcher::new(config, Arc::new(launcher), ProgressSink::disabled()).unwrap();
        let shared = d.shared();

        let running = Arc::new(AtomicBool::new(true));
        let sampler = {
            let shared = shared.clone();
            let running = running.clone();
            let launched = launched.clone();
            thread::spawn(move || {
                let mut samples = 0usize;
                while running.load(Ordering::SeqCst) {
                    let counts = shared.census.snapshot();
                    // A helper is launched before its worker enlists.
                    let spawned = launched.load(Ordering::SeqCst);
                    assert!(counts.idle <= counts.live, "census {:?}", counts);
                    assert!(counts.live <= spawned, "census {:?}, {} spawned", counts, spawned);
                    samples += 1;
                }
                samples
            })
        };

        let delays = [10u8, 25, 5, 15, 0, 30];
        for round in 1..=delays.len() {
            let frames: Vec<Frame> = delays[..round].iter().map(|&ms| frame(&[ms])).collect();
            assert_eq!(d.process_batch(frames.clone()).unwrap(), frames);
            if round % 2 == 0 {
                // Long enough for idle workers to retire.
                thread::sleep(Duration::from_millis(80));
            }
        }

        running.store(false, Ordering::SeqCst);
        let samples = sampler.join().unwrap();
        let report = d.shutdown(StopMode::Graceful);

        assert!(samples > 0);
        assert_eq!(report.workers(), launched.load(Ordering::SeqCst));
        assert!(report.idle_timeouts() >= 1);
        assert_eq!(report.items_processed(), 21);
        assert_eq!(shared.census.snapshot(), CensusCounts::default());
    }

    #[test]
    fn test_timeout_abandons_batch_and_discards_stale_results() {
        let mut config = config(1);
        config.collect_deadline = Duration::from_millis(60);
        let mut d = Dispatcher::new(config, Arc::new(sleepy()), ProgressSink::disabled()).unwrap();

        d.send_batch(vec![frame(&[150])]).unwrap();
        match d.collect_batch() {
            Err(PoolError::DispatchTimeout { pending, waited }) => {
                assert_eq!(pending, 1);
                assert!(waited >= Duration::from_millis(60));
            }
            other => panic!("Expected DispatchTimeout, got {:?}", other),
        }
        assert_eq!(d.pending(), 0);

        // The late result for batch 1 arrives while batch 2 is collected and
        // must not be mistaken for batch 2's item 0.
        let out = d.process_batch(vec![frame(&[0, 9])]).unwrap();
        assert_eq!(out, vec![frame(&[0, 9])]);
        d.shutdown(StopMode::Graceful);
    }

    #[test]
    fn test_stale_result_ignored() {
        let mut d = dispatcher(0, ThreadLauncher::new(AnalysisSpec::default()));
        d.shared().publish(ResultItem {
            batch: 99,
            sequence_id: 0,
            frame: frame(&[7]),
        });
        let out = d.process_batch(vec![frame(&[1])]).unwrap();
        assert_eq!(out, vec![frame(&[1])]);
        d.shutdown(StopMode::Graceful);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_order_invariance(delays in prop::collection::vec(0u8..20, 0..12), workers in 1usize..5) {
            let mut d = dispatcher(workers, sleepy());
            let frames: Vec<Frame> = delays
                .iter()
                .enumerate()
                .map(|(i, &delay)| frame(&[delay, i as u8]))
                .collect();
            let out = d.process_batch(frames.clone()).unwrap();
            d.shutdown(StopMode::Graceful);
            prop_assert_eq!(out, frames);
        }
    }
}
