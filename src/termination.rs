//! Worker termination analysis.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// Why (or whether) a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// The process could not be waited for (`ECHILD`); someone else reaped it.
    Lost,
    /// Process is still running.
    StillAlive,
    /// Stopped, continued or another non-terminal status.
    Unknown,
}

impl TerminationReason {
    /// Whether the process is gone, however it went.
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::StillAlive | Self::Unknown)
    }

    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(Signal::SIGKILL) => "killed by SIGKILL (possibly the OOM killer)".into(),
            Self::Signaled(Signal::SIGSEGV) => "crashed with SIGSEGV".into(),
            Self::Signaled(Signal::SIGABRT) => "aborted (SIGABRT)".into(),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Lost => "already reaped by another waiter".into(),
            Self::StillAlive => "still running".into(),
            Self::Unknown => "unknown state".into(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, _) => Self::Signaled(signal),
            WaitStatus::StillAlive => Self::StillAlive,
            _ => Self::Unknown,
        }
    }
}
