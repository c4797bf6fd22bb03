//! Helper subprocess spawning.
//!
//! Helpers are the current executable re-run in `helper` mode, so the
//! analyzer code that runs in a helper is always the same build as the pool
//! driving it.

use super::helper::{Helper, HelperLauncher};
use super::proc::{Proc, Received};
use super::protocol::{HelperRequest, HelperResponse};
use super::shared::{ResultItem, WorkItem};
use crate::analysis::AnalysisSpec;
use crate::error::{PoolError, Result};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

/// How long a fresh helper may take to report ready.
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Launches helpers as separate OS processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    /// Arguments placed before the `helper` subcommand.
    prefix_args: Vec<String>,
    analysis: AnalysisSpec,
    startup_timeout: Duration,
    stop_timeout: Duration,
}

impl ProcessLauncher {
    /// Launch helpers from the currently running executable.
    pub fn current_exe(analysis: AnalysisSpec) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| PoolError::Spawn(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(program, analysis))
    }

    /// Launch helpers from an explicit program path.
    pub fn new(program: impl Into<PathBuf>, analysis: AnalysisSpec) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            analysis,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// The full command line for worker `worker_id`'s helper.
    fn command(&self, worker_id: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args);
        cmd.arg("helper");
        cmd.arg("--analyzer").arg(self.analysis.kind.to_string());
        cmd.arg("--threshold").arg(self.analysis.threshold.to_string());
        cmd.arg("--delay-ms")
            .arg(self.analysis.delay.as_millis().to_string());
        cmd.arg("--worker-id").arg(worker_id.to_string());

        // stdout carries the protocol; diagnostics go to the parent's stderr.
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd
    }

    fn await_ready(&self, proc: &mut Proc, worker_id: usize) -> Result<()> {
        match proc.recv_timeout(self.startup_timeout) {
            Ok(Received::Response(HelperResponse::Ready)) => Ok(()),
            Ok(Received::Response(other)) => Err(PoolError::Spawn(format!(
                "helper {} sent {:?} before ready",
                worker_id, other
            ))),
            Ok(Received::Pending) => Err(PoolError::Spawn(format!(
                "helper {} did not report ready within {:?}",
                worker_id, self.startup_timeout
            ))),
            Ok(Received::Closed) => {
                let reason = match proc.wait_timeout(self.stop_timeout) {
                    Ok(Some(reason)) => reason.to_string(),
                    Ok(None) => "closed its output".to_string(),
                    Err(e) => e.to_string(),
                };
                Err(PoolError::Spawn(format!(
                    "helper {} exited during startup: {}",
                    worker_id, reason
                )))
            }
            Err(e) => Err(PoolError::Spawn(format!(
                "helper {} failed during startup: {}",
                worker_id, e
            ))),
        }
    }
}

impl HelperLauncher for ProcessLauncher {
    fn launch(&self, worker_id: usize) -> Result<Box<dyn Helper>> {
        let child = self.command(worker_id).spawn().map_err(|e| {
            PoolError::Spawn(format!(
                "Failed to spawn helper {}: {}",
                self.program.display(),
                e
            ))
        })?;

        let mut proc = Proc::from_child(child, &format!("helper-{}", worker_id))?;
        if let Err(e) = self.await_ready(&mut proc, worker_id) {
            let _ = proc.kill();
            return Err(e);
        }

        debug!(worker_id, pid = proc.pid().as_raw(), "Helper ready");
        Ok(Box::new(ProcessHelper {
            worker_id,
            proc,
            stop_timeout: self.stop_timeout,
        }))
    }

    fn describe(&self) -> String {
        format!("process ({})", self.analysis.kind)
    }
}

/// A helper running in its own OS process.
pub struct ProcessHelper {
    worker_id: usize,
    proc: Proc,
    stop_timeout: Duration,
}

impl Helper for ProcessHelper {
    fn submit(&mut self, item: WorkItem) -> Result<()> {
        self.proc.send(&HelperRequest::analyze(
            item.batch,
            item.sequence_id,
            item.frame,
        ))
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<ResultItem>> {
        match self.proc.recv_timeout(timeout)? {
            Received::Pending => Ok(None),
            Received::Response(HelperResponse::Result {
                batch,
                sequence_id,
                frame,
            }) => Ok(Some(ResultItem {
                batch,
                sequence_id,
                frame,
            })),
            Received::Response(HelperResponse::Error {
                sequence_id,
                message,
                ..
            }) => Err(PoolError::Analysis {
                sequence_id,
                message,
            }),
            Received::Response(HelperResponse::Ready) => {
                debug!(worker_id = self.worker_id, "Ignoring repeated ready");
                Ok(None)
            }
            Received::Closed => {
                let reason = match self.proc.wait_timeout(self.stop_timeout) {
                    Ok(Some(reason)) => reason,
                    Ok(None) => {
                        return Err(PoolError::Helper(format!(
                            "helper {} closed its output",
                            self.worker_id
                        )));
                    }
                    Err(e) => return Err(e),
                };
                if reason.is_abnormal() {
                    warn!(worker_id = self.worker_id, reason = %reason, "Helper died");
                }
                Err(PoolError::Helper(format!(
                    "helper {} {}",
                    self.worker_id, reason
                )))
            }
        }
    }

    fn stop(&mut self, forced: bool) {
        let outcome = if forced {
            self.proc.kill()
        } else {
            self.proc.stop(self.stop_timeout)
        };
        match outcome {
            Ok(reason) if reason.is_abnormal() => {
                warn!(worker_id = self.worker_id, reason = %reason, "Helper stopped abnormally")
            }
            Ok(reason) => debug!(worker_id = self.worker_id, reason = %reason, "Helper stopped"),
            Err(e) => warn!(worker_id = self.worker_id, error = %e, "Failed to stop helper"),
        }
    }

    fn pid(&self) -> Option<u32> {
        u32::try_from(self.proc.pid().as_raw()).ok()
    }
}
