//! In-process helpers.
//!
//! Each helper is a dedicated thread owning its own analyzer. Used by
//! `--backend thread` and by tests that need custom analyzers.

use super::helper::{Helper, HelperLauncher};
use super::shared::{ResultItem, WorkItem};
use crate::analysis::{AnalysisSpec, Analyzer};
use crate::error::{PoolError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type AnalyzerFactory = dyn Fn(usize) -> Box<dyn Analyzer> + Send + Sync;

/// Launches helpers as threads of the current process.
#[derive(Clone)]
pub struct ThreadLauncher {
    factory: Arc<AnalyzerFactory>,
    label: String,
    stop_timeout: Duration,
}

impl ThreadLauncher {
    /// Helpers running one of the built-in analyzers.
    pub fn new(spec: AnalysisSpec) -> Self {
        let label = format!("thread ({})", spec.kind);
        Self {
            factory: Arc::new(move |_| -> Box<dyn Analyzer> { Box::new(spec.build()) }),
            label,
            stop_timeout: Duration::from_secs(2),
        }
    }

    /// Helpers built by `factory`, which receives the worker id.
    pub fn from_fn<F, A>(factory: F) -> Self
    where
        F: Fn(usize) -> A + Send + Sync + 'static,
        A: Analyzer + 'static,
    {
        Self {
            factory: Arc::new(move |id| -> Box<dyn Analyzer> { Box::new(factory(id)) }),
            label: "thread (custom)".to_string(),
            stop_timeout: Duration::from_secs(2),
        }
    }

    /// How long a stop waits for the helper thread to finish the frame it
    /// is analyzing before leaving it behind.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for ThreadLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLauncher")
            .field("label", &self.label)
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

impl HelperLauncher for ThreadLauncher {
    fn launch(&self, worker_id: usize) -> Result<Box<dyn Helper>> {
        let mut analyzer = (self.factory)(worker_id);
        let (request_tx, request_rx) = bounded::<WorkItem>(1);
        let (result_tx, result_rx) = bounded::<Result<ResultItem>>(1);

        let handle = thread::Builder::new()
            .name(format!("helper-{}", worker_id))
            .spawn(move || {
                for item in request_rx {
                    let sequence_id = item.sequence_id;
                    let outcome = analyzer
                        .analyze(item.frame)
                        .map(|frame| ResultItem {
                            batch: item.batch,
                            sequence_id,
                            frame,
                        })
                        .map_err(|e| PoolError::Analysis {
                            sequence_id,
                            message: e.to_string(),
                        });
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| PoolError::Spawn(format!("Failed to start helper thread: {}", e)))?;

        Ok(Box::new(ThreadHelper {
            worker_id,
            requests: Some(request_tx),
            results: result_rx,
            handle: Some(handle),
            stop_timeout: self.stop_timeout,
        }))
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// A helper running on its own thread.
pub struct ThreadHelper {
    worker_id: usize,
    requests: Option<Sender<WorkItem>>,
    results: Receiver<Result<ResultItem>>,
    handle: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl ThreadHelper {
    /// Join the helper thread if it finishes within `stop_timeout`,
    /// otherwise leave it behind. A thread cannot be killed; it exits after
    /// its current frame.
    fn join_within(&self, handle: JoinHandle<()>) {
        let start = Instant::now();
        while !handle.is_finished() {
            if start.elapsed() >= self.stop_timeout {
                warn!(
                    worker_id = self.worker_id,
                    waited_ms = self.stop_timeout.as_millis() as u64,
                    "Helper thread still busy after stop timeout; detaching"
                );
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            debug!(worker_id = self.worker_id, "Helper thread panicked");
        }
    }
}

impl Helper for ThreadHelper {
    fn submit(&mut self, item: WorkItem) -> Result<()> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| PoolError::Helper("helper already stopped".into()))?;
        requests
            .send(item)
            .map_err(|_| PoolError::Helper(format!("helper {} thread exited", self.worker_id)))
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<ResultItem>> {
        match self.results.recv_timeout(timeout) {
            Ok(outcome) => outcome.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PoolError::Helper(format!(
                "helper {} thread exited",
                self.worker_id
            ))),
        }
    }

    fn stop(&mut self, forced: bool) {
        // Closing the request channel ends the helper loop.
        self.requests = None;
        let Some(handle) = self.handle.take() else {
            return;
        };
        if forced {
            self.join_within(handle);
        } else if handle.join().is_err() {
            debug!(worker_id = self.worker_id, "Helper thread panicked");
        }
    }
}

impl Drop for ThreadHelper {
    fn drop(&mut self) {
        self.stop(true);
    }
}
