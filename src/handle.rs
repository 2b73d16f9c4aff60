//! Future handles and worker process tracking.

use crate::segment::SegmentInfo;
use crate::termination::TerminationReason;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

/// Unique identifier of a dispatched future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FutureId(Uuid);

impl FutureId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FutureId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-side reference to one outstanding worker.
///
/// Not `Clone`: collecting a result consumes the handle, so the same handle
/// cannot be collected twice.
///
/// The handle owns nothing. Dropping it without collecting leaves the worker
/// and its segment registered with the executor until a `wait`, `clean`,
/// `shutdown` or the executor's own drop releases them.
#[derive(Debug, PartialEq, Eq)]
pub struct FutureHandle {
    id: FutureId,
    pid: Pid,
    segment: SegmentInfo,
}

impl FutureHandle {
    pub(crate) fn new(id: FutureId, pid: Pid, segment: SegmentInfo) -> Self {
        Self { id, pid, segment }
    }

    pub fn id(&self) -> FutureId {
        self.id
    }

    /// Process id of the worker.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The shared memory segment the worker writes into.
    pub fn segment(&self) -> SegmentInfo {
        self.segment
    }
}

impl fmt::Display for FutureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

/// Poll interval while waiting out the termination grace period.
const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Parent-side view of a forked worker process.
#[derive(Debug)]
pub(crate) struct WorkerProc {
    pid: Pid,
    /// Set once the process has been reaped (or found unreapable).
    exit: Option<TerminationReason>,
}

impl WorkerProc {
    pub(crate) fn new(pid: Pid) -> Self {
        Self { pid, exit: None }
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    /// Check if the process has finished (non-blocking).
    ///
    /// A process that cannot be waited for counts as finished.
    pub(crate) fn poll(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => false,
            Ok(status) => {
                let reason = TerminationReason::from(status);
                if reason.is_finished() {
                    self.exit = Some(reason);
                }
                reason.is_finished()
            }
            Err(errno) => {
                if errno != Errno::ECHILD {
                    warn!(pid = %self.pid, %errno, "waitpid failed while polling worker");
                }
                self.exit = Some(TerminationReason::Lost);
                true
            }
        }
    }

    /// Wait for the process to exit (blocking).
    pub(crate) fn wait(&mut self) -> TerminationReason {
        loop {
            if let Some(reason) = self.exit {
                return reason;
            }
            match waitpid(self.pid, None) {
                Ok(status) => {
                    let reason = TerminationReason::from(status);
                    if reason.is_finished() {
                        self.exit = Some(reason);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    if errno != Errno::ECHILD {
                        warn!(pid = %self.pid, %errno, "waitpid failed while waiting for worker");
                    }
                    self.exit = Some(TerminationReason::Lost);
                }
            }
        }
    }

    /// Stop the worker: SIGTERM, wait up to `grace`, then SIGKILL and reap.
    pub(crate) fn terminate(&mut self, grace: Duration) -> TerminationReason {
        if self.poll() {
            return self.wait();
        }

        if let Err(errno) = signal::kill(self.pid, Signal::SIGTERM) {
            warn!(pid = %self.pid, %errno, "Failed to send SIGTERM to worker");
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if self.poll() {
                return self.wait();
            }
            std::thread::sleep(TERMINATE_POLL_INTERVAL);
        }

        if !self.poll() {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
        }
        self.wait()
    }
}
