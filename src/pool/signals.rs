//! Exit analysis for helper subprocesses.
//!
//! When a helper disappears mid-conversation, the worker reaps it and logs
//! why it went away.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason why a helper process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal the pool itself sends when stopping helpers.
    Stopped(Signal),
    /// Likely out of memory (SIGKILL we did not send).
    OutOfMemory,
    /// Crashed (SIGSEGV, SIGBUS, SIGABRT, ...).
    Crashed(Signal),
    /// Killed by some other signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Whether the helper died on its own rather than being asked to.
    pub fn is_abnormal(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::Crashed(_) | Self::Signaled(_)
        ) || matches!(self, Self::Exited(code) if *code != 0)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Stopped(sig) => format!("stopped by {:?}", sig),
            Self::OutOfMemory => "out of memory (SIGKILL from OOM killer)".to_string(),
            Self::Crashed(sig) => format!("crashed with {:?}", sig),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
///
/// `killed_by_pool` tells whether the pool sent SIGTERM/SIGKILL itself, so an
/// intentional kill is not mistaken for the OOM killer.
pub fn analyze_wait_status(status: WaitStatus, killed_by_pool: bool) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),

        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGTERM | Signal::SIGKILL if killed_by_pool => {
                TerminationReason::Stopped(signal)
            }
            Signal::SIGKILL => TerminationReason::OutOfMemory,
            Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGABRT | Signal::SIGILL => {
                TerminationReason::Crashed(signal)
            }
            _ => TerminationReason::Signaled(signal),
        },

        WaitStatus::StillAlive => TerminationReason::StillAlive,

        _ => TerminationReason::Unknown,
    }
}
