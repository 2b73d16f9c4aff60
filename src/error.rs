//! Error types for shmfork.

use crate::handle::FutureId;
use crate::segment::SegmentError;
use crate::wire::{WireError, WorkerFailure};
use nix::errno::Errno;
use thiserror::Error;

/// Main error type for shmfork.
#[derive(Error, Debug)]
pub enum ShmforkError {
    #[error("Failed to acquire a shared memory segment after {attempts} attempts (last error: {last})")]
    ResourceExhausted { attempts: usize, last: Errno },

    #[error("Failed to fork worker process: {0}")]
    ForkFailed(Errno),

    #[error("Worker failed: {0}")]
    Worker(#[from] WorkerFailure),

    #[error("Shared memory error: {0}")]
    Segment(#[from] SegmentError),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Future {0} is not registered (already collected or reaped)")]
    UnknownFuture(FutureId),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ShmforkError {
    /// Returns the captured worker failure, if this error carries one.
    pub fn worker_failure(&self) -> Option<&WorkerFailure> {
        match self {
            Self::Worker(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias for shmfork operations.
pub type Result<T> = std::result::Result<T, ShmforkError>;
