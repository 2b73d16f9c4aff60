//! shmfork - run closures in forked worker processes.
//!
//! Each dispatched work item runs in its own child process. The child writes
//! its result (or its failure) into a SysV shared memory segment and exits;
//! the parent collects it through an [`Executor`].
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────────────┐
//!                      │   Parent (Executor)  │
//!                      │  id -> pid + segment │
//!                      └──────────┬───────────┘
//!                  fork()         │         waitpid() + read
//!               ┌─────────────────┼─────────────────┐
//!         ┌─────▼─────┐     ┌─────▼─────┐     ┌─────▼─────┐
//!         │ Worker 1  │     │ Worker 2  │     │ Worker N  │
//!         │ work()    │     │ work()    │     │ work()    │
//!         └─────┬─────┘     └─────┬─────┘     └─────┬─────┘
//!               ▼                 ▼                 ▼
//!          [len|kind|body]   [len|kind|body]   [len|kind|body]
//!           shm segment       shm segment       shm segment
//! ```
//!
//! # Example
//!
//! ```no_run
//! use shmfork::{Executor, ExecutorConfig};
//! use std::convert::Infallible;
//!
//! let mut exec: Executor<u64> = Executor::new(ExecutorConfig::default())?;
//! let handle = exec.dispatch(|| Ok::<_, Infallible>((1..=20).product()))?;
//! assert_eq!(exec.wait_for(handle)?, 2_432_902_008_176_640_000);
//! # Ok::<(), shmfork::ShmforkError>(())
//! ```
//!
//! Unix only: relies on `fork(2)` and SysV shared memory.

pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod logging;
pub mod registry;
pub mod segment;
pub mod size;
pub mod termination;
pub mod wire;
mod worker;

pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use config::{ExecutorConfig, ReapPolicy};
pub use error::{Result, ShmforkError};
pub use handle::{FutureHandle, FutureId};
pub use registry::Executor;
pub use segment::{FtokKeys, KeySource, SegmentInfo};
pub use size::ByteSize;
pub use wire::{FailureKind, Outcome, WorkerFailure};
