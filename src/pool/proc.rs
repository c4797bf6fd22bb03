//! Process handle for helper subprocesses.
//!
//! Wraps a child process with its IPC channels. Responses are read by a
//! dedicated collector thread and forwarded over a channel, so the worker
//! can wait for them with a timeout and keep observing the termination
//! signal while a helper is busy.

use super::ipc::{LineReader, LineWriter};
use super::protocol::{HelperRequest, HelperResponse};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{PoolError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::process::{Child, ChildStdin, ChildStdout};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Outcome of waiting for a helper response.
#[derive(Debug)]
pub enum Received {
    Response(HelperResponse),
    /// Nothing arrived within the timeout.
    Pending,
    /// The helper closed its stdout; it has exited or is about to.
    Closed,
}

/// Handle to a helper subprocess with IPC channels.
pub struct Proc {
    pid: Pid,
    writer: LineWriter<ChildStdin>,
    responses: Receiver<Result<HelperResponse>>,
    collector: Option<JoinHandle<()>>,
    reaped: bool,
    /// Set once we have sent SIGTERM/SIGKILL ourselves.
    signaled: bool,
}

impl Proc {
    /// Create from a spawned `std::process::Child`.
    ///
    /// Takes ownership of the child's stdin and stdout and starts the
    /// collector thread named after `label`.
    pub fn from_child(mut child: Child, label: &str) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("Child stdout not captured".into()))?;

        let (tx, responses) = unbounded();
        let collector = thread::Builder::new()
            .name(format!("{}-collector", label))
            .spawn(move || collect_responses(stdout, tx))
            .map_err(|e| PoolError::Spawn(format!("Failed to start collector thread: {}", e)))?;

        Ok(Self {
            pid,
            writer: LineWriter::new(stdin),
            responses,
            collector: Some(collector),
            reaped: false,
            signaled: false,
        })
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send a request to the helper.
    pub fn send(&mut self, request: &HelperRequest) -> Result<()> {
        let line = request.to_line()?;
        self.writer
            .write_line(&line)
            .map_err(|e| PoolError::Helper(format!("Failed to send to helper: {}", e)))
    }

    /// Wait up to `timeout` for the next response.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Received> {
        match self.responses.recv_timeout(timeout) {
            Ok(Ok(response)) => Ok(Received::Response(response)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(Received::Pending),
            Err(RecvTimeoutError::Disconnected) => Ok(Received::Closed),
        }
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        matches!(self.try_wait(), Ok(None))
    }

    /// Try to reap the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if self.reaped {
            return Err(PoolError::Helper("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(analyze_wait_status(status, self.signaled)))
            }
            Err(e) => {
                self.reaped = true;
                Err(PoolError::Helper(format!("waitpid failed: {}", e)))
            }
        }
    }

    /// Wait for the process to exit, polling every few milliseconds.
    ///
    /// Returns `None` if it is still alive after `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<TerminationReason>> {
        let start = Instant::now();
        loop {
            if let Some(reason) = self.try_wait()? {
                return Ok(Some(reason));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        self.signaled = true;
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| PoolError::Helper(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and reap it.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        if self.reaped {
            return Ok(TerminationReason::Unknown);
        }
        self.signaled = true;
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| PoolError::Helper(format!("Failed to send SIGKILL: {}", e)))?;
        let status =
            waitpid(self.pid, None).map_err(|e| PoolError::Helper(format!("waitpid failed: {}", e)))?;
        self.reaped = true;
        self.join_collector();
        Ok(analyze_wait_status(status, true))
    }

    /// Gracefully stop the helper: send exit, wait, then escalate to
    /// SIGTERM and finally SIGKILL.
    pub fn stop(&mut self, timeout: Duration) -> Result<TerminationReason> {
        if self.reaped {
            return Ok(TerminationReason::Unknown);
        }

        let _ = self.send(&HelperRequest::Exit);
        if let Some(reason) = self.wait_timeout(timeout)? {
            self.join_collector();
            return Ok(reason);
        }

        let _ = self.terminate();
        if let Some(reason) = self.wait_timeout(Duration::from_millis(100))? {
            self.join_collector();
            return Ok(reason);
        }

        self.kill()
    }

    fn join_collector(&mut self) {
        if let Some(handle) = self.collector.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.terminate();
            thread::sleep(Duration::from_millis(10));

            if let Ok(Some(_)) = self.try_wait() {
                self.join_collector();
                return;
            }

            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
        self.join_collector();
    }
}

/// Collector loop: parse response lines until EOF.
fn collect_responses(stdout: ChildStdout, tx: Sender<Result<HelperResponse>>) {
    let mut reader = LineReader::new(stdout);
    loop {
        let message = match reader.read_line() {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => HelperResponse::from_line(line)
                .map_err(|e| PoolError::Helper(format!("Invalid helper response: {}", e))),
            Ok(None) => return,
            Err(e) => Err(PoolError::Helper(format!(
                "Failed to receive from helper: {}",
                e
            ))),
        };
        let fatal = message.is_err();
        if tx.send(message).is_err() || fatal {
            return;
        }
    }
}
