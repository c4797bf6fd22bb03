//! Pool tests against real helper processes.
//!
//! Helpers are the `visionpool helper` command of the binary under test.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use visionpool::analysis::{AnalysisSpec, AnalyzerKind};
use visionpool::config::PoolConfig;
use visionpool::frame::Frame;
use visionpool::pool::{Dispatcher, ExitReason, ProcessLauncher, StopMode};
use visionpool::progress::ProgressSink;

fn launcher(spec: AnalysisSpec) -> Arc<ProcessLauncher> {
    Arc::new(
        ProcessLauncher::new(env!("CARGO_BIN_EXE_visionpool"), spec)
            .with_stop_timeout(Duration::from_secs(2)),
    )
}

fn config(helper_timeout_secs: f64, workers: usize) -> PoolConfig {
    PoolConfig::new(helper_timeout_secs, workers)
        .unwrap()
        .with_poll_interval(Duration::from_millis(10))
        .with_collect_deadline(Duration::from_secs(20))
}

/// Poll `cond` until it holds or `limit` passes.
fn wait_for(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn numbered_frames(n: u8) -> Vec<Frame> {
    (0..n)
        .map(|i| Frame::new(1, 1, 3, vec![i, i + 1, i + 2]).unwrap())
        .collect()
}

#[test]
fn test_round_trip_through_processes() {
    let mut d = Dispatcher::new(
        config(30.0, 2),
        launcher(AnalysisSpec::new(AnalyzerKind::Reverse)),
        ProgressSink::disabled(),
    )
    .unwrap();

    let results = d.process_batch(numbered_frames(4)).unwrap();
    let report = d.shutdown(StopMode::Graceful);

    assert_eq!(results.len(), 4);
    for (i, frame) in results.iter().enumerate() {
        let i = i as u8;
        assert_eq!(frame.data, vec![i + 2, i + 1, i]);
    }
    // Two prestarted workers plus at least two spawned for the four-item
    // batch; more if the prestarted ones claimed items before the count.
    assert!((4..=6).contains(&report.workers()));
    assert_eq!(report.items_processed(), 4);
    assert_eq!(report.items_lost(), 0);
}

#[test]
fn test_consecutive_batches_reuse_helpers() {
    let mut d = Dispatcher::new(
        config(30.0, 3),
        launcher(AnalysisSpec::new(AnalyzerKind::Invert)),
        ProgressSink::disabled(),
    )
    .unwrap();

    for round in 0..3u8 {
        let frames = vec![Frame::filled(2, 2, 1, round); 3];
        let results = d.process_batch(frames).unwrap();
        assert!(results.iter().all(|f| f.data == vec![255 - round; 4]));
    }
    assert!(d.manager().roster_len() >= 3);

    let report = d.shutdown(StopMode::Graceful);
    assert_eq!(report.items_processed(), 9);
    assert_eq!(report.items_lost(), 0);
}

#[test]
fn test_idle_helpers_retire() {
    let mut d = Dispatcher::new(
        config(0.2, 2),
        launcher(AnalysisSpec::default()),
        ProgressSink::disabled(),
    )
    .unwrap();
    let shared = d.shared();

    assert!(wait_for(Duration::from_secs(10), || shared.census.live() == 0));

    let report = d.shutdown(StopMode::Graceful);
    assert_eq!(report.idle_timeouts(), 2);
}

#[test]
fn test_forced_shutdown_kills_busy_helpers() {
    let mut d = Dispatcher::new(
        config(30.0, 2),
        launcher(AnalysisSpec::new(AnalyzerKind::Identity).with_delay(Duration::from_secs(30))),
        ProgressSink::disabled(),
    )
    .unwrap();
    let shared = d.shared();

    d.send_batch(numbered_frames(2)).unwrap();
    assert!(wait_for(Duration::from_secs(10), || shared.input_is_empty()));
    // Let the helpers receive their frames.
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    let report = d.shutdown(StopMode::Forced);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(report.workers() >= 2);
    assert!(
        report
            .exits
            .iter()
            .all(|e| e.reason == ExitReason::Stopped(StopMode::Forced))
    );
    assert_eq!(report.items_processed(), 0);
}

#[test]
fn test_graceful_shutdown_finishes_item_in_hand() {
    let mut d = Dispatcher::new(
        config(30.0, 1),
        launcher(
            AnalysisSpec::new(AnalyzerKind::Identity).with_delay(Duration::from_millis(300)),
        ),
        ProgressSink::disabled(),
    )
    .unwrap();
    let shared = d.shared();

    d.send_batch(numbered_frames(1)).unwrap();
    assert!(wait_for(Duration::from_secs(10), || shared.input_is_empty()));

    let report = d.shutdown(StopMode::Graceful);
    assert_eq!(report.items_processed(), 1);
    assert_eq!(report.items_lost(), 0);
    assert_eq!(shared.progress.processed(), 1);
}

#[test]
fn test_missing_helper_program_fails_startup() {
    let launcher = Arc::new(ProcessLauncher::new(
        "/nonexistent/visionpool",
        AnalysisSpec::default(),
    ));
    let result = Dispatcher::new(config(30.0, 1), launcher, ProgressSink::disabled());
    assert!(result.is_err());
}
