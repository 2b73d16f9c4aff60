//! The executor: dispatches work items to forked workers and tracks their futures.
//!
//! An [`Executor`] is an explicit context object. It owns every pending
//! worker's segment and is the only place results are collected from. It is
//! `!Send`; all access happens from the thread that created it.

use crate::codec::{BincodeCodec, Codec};
use crate::config::{ExecutorConfig, ReapPolicy};
use crate::error::{Result, ShmforkError};
use crate::handle::{FutureHandle, FutureId, WorkerProc};
use crate::segment::{FtokKeys, KeySource, Segment, SegmentAllocator};
use crate::size::ByteSize;
use crate::wire::{self, Outcome, WireError, WorkerFailure};
use crate::worker;
use nix::unistd::{ForkResult, fork};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// A dispatched worker that has not been collected yet.
#[derive(Debug)]
struct PendingFuture {
    proc: WorkerProc,
    segment: Segment,
    dispatched_at: Instant,
}

/// Registry of in-flight futures producing values of type `T`.
///
/// Results are encoded with the codec `C`, which defaults to bincode.
pub struct Executor<T, C = BincodeCodec> {
    config: ExecutorConfig,
    allocator: SegmentAllocator,
    entries: HashMap<FutureId, PendingFuture>,
    last_reap: Option<Instant>,
    _marker: PhantomData<fn() -> (T, C)>,
}

impl<T, C> Executor<T, C> {
    /// Create an executor, namespacing keys by `config.key_path` or the
    /// current executable.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        let keys = match &config.key_path {
            Some(path) => FtokKeys::new(path)?,
            None => FtokKeys::for_current_exe()?,
        };
        Self::with_key_source(config, Box::new(keys))
    }

    /// Create an executor with a custom key source.
    pub fn with_key_source(config: ExecutorConfig, keys: Box<dyn KeySource>) -> Result<Self> {
        config.validate()?;
        let allocator = SegmentAllocator::new(keys, config.max_attempts);
        Ok(Self {
            config,
            allocator,
            entries: HashMap::new(),
            last_reap: None,
            _marker: PhantomData,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn segment_size(&self) -> ByteSize {
        self.config.segment_size
    }

    /// Change the capacity of segments created by later dispatches.
    pub fn set_segment_size(&mut self, size: ByteSize) -> Result<()> {
        let config = self.config.clone().with_segment_size(size);
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn permissions(&self) -> u32 {
        self.config.permissions
    }

    /// Change the permission bits of segments created by later dispatches.
    pub fn set_permissions(&mut self, permissions: u32) -> Result<()> {
        let config = self.config.clone().with_permissions(permissions);
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Check whether the worker behind `handle` has finished. Never blocks.
    ///
    /// Futures that are no longer registered count as done.
    pub fn is_done(&mut self, handle: &FutureHandle) -> bool {
        self.entries
            .get_mut(&handle.id())
            .is_none_or(|pending| pending.proc.poll())
    }

    /// Number of registered futures.
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    /// Number of registered futures whose worker is still running.
    pub fn running(&mut self) -> usize {
        self.entries
            .values_mut()
            .map(|pending| pending.proc.poll())
            .filter(|done| !done)
            .count()
    }

    /// Ids of all registered futures, in no particular order.
    pub fn ids(&self) -> Vec<FutureId> {
        self.entries.keys().copied().collect()
    }

    /// Terminate a worker, reap it, destroy its segment and deregister it.
    fn close(&mut self, id: FutureId) -> bool {
        let Some(mut pending) = self.entries.remove(&id) else {
            return false;
        };
        let reason = pending.proc.terminate(self.config.kill_grace);
        if let Err(e) = pending.segment.destroy() {
            warn!(future = %id, error = %e, "Failed to destroy segment while closing");
        }
        debug!(future = %id, worker = %pending.proc.pid(), %reason, "Future closed");
        true
    }

    /// Close unfinished futures selected by the reap policy.
    ///
    /// Runs at most once per `reap_interval`; returns 0 when throttled.
    /// Closing discards whatever the worker was computing.
    pub fn clean(&mut self) -> usize {
        let now = Instant::now();
        if let Some(last) = self.last_reap
            && now.duration_since(last) < self.config.reap_interval
        {
            return 0;
        }
        self.last_reap = Some(now);

        let policy = self.config.reap_policy;
        let stale: Vec<FutureId> = self
            .entries
            .iter_mut()
            .filter_map(|(id, pending)| {
                let eligible = match policy {
                    ReapPolicy::Sweep => true,
                    ReapPolicy::OlderThan(limit) => {
                        now.duration_since(pending.dispatched_at) > limit
                    }
                };
                (eligible && !pending.proc.poll()).then_some(*id)
            })
            .collect();

        let closed = stale.into_iter().filter(|id| self.close(*id)).count();
        if closed > 0 {
            debug!(closed, "Reaped unfinished futures");
        }
        closed
    }

    /// Close every registered future, finished or not.
    pub fn shutdown(&mut self) -> usize {
        let ids = self.ids();
        ids.into_iter().filter(|id| self.close(*id)).count()
    }
}

impl<T, C> Executor<T, C>
where
    T: Serialize + DeserializeOwned,
    C: Codec,
{
    /// Run `work` in a forked worker and return a handle to its result.
    ///
    /// Returns as soon as the worker has been forked. `Err` values and
    /// panics from `work` are reported when the result is collected.
    pub fn dispatch<F, E>(&mut self, work: F) -> Result<FutureHandle>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: fmt::Display,
    {
        let parent = std::process::id();
        debug!(pid = parent, work = std::any::type_name::<F>(), "Preparing to dispatch");

        let mut segment = self.allocator.acquire(
            self.config.segment_size.as_usize(),
            self.config.permissions,
        )?;

        // SAFETY: the child only runs `work`, writes the segment and calls
        // `_exit`; it never returns into the caller.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => worker::run::<T, C, F, E>(segment, work),
            Ok(ForkResult::Parent { child }) => {
                let id = FutureId::new();
                let handle = FutureHandle::new(id, child, segment.info());
                debug!(pid = parent, worker = %child, future = %id, "Future created");
                self.entries.insert(
                    id,
                    PendingFuture {
                        proc: WorkerProc::new(child),
                        segment,
                        dispatched_at: Instant::now(),
                    },
                );
                Ok(handle)
            }
            Err(errno) => {
                if let Err(e) = segment.destroy() {
                    warn!(error = %e, "Failed to destroy segment after fork failure");
                }
                Err(ShmforkError::ForkFailed(errno))
            }
        }
    }

    /// Run `work(args)` in a forked worker.
    pub fn dispatch_with<F, A, E>(&mut self, work: F, args: A) -> Result<FutureHandle>
    where
        F: FnOnce(A) -> std::result::Result<T, E>,
        E: fmt::Display,
    {
        self.dispatch(move || work(args))
    }

    /// Block until the worker exits and return its result.
    ///
    /// A failure in the worker is returned as [`ShmforkError::Worker`].
    pub fn wait_for(&mut self, handle: FutureHandle) -> Result<T> {
        self.collect(handle.id())
    }

    /// Collect every registered future.
    ///
    /// Stops at the first failure; futures not yet collected stay registered.
    pub fn wait(&mut self) -> Result<HashMap<FutureId, T>> {
        let mut results = HashMap::with_capacity(self.entries.len());
        while let Some(id) = self.entries.keys().next().copied() {
            let value = self.collect(id)?;
            results.insert(id, value);
        }
        Ok(results)
    }

    /// Collect every registered future, keeping failures alongside successes.
    pub fn wait_settled(&mut self) -> HashMap<FutureId, Result<T>> {
        let mut results = HashMap::with_capacity(self.entries.len());
        while let Some(id) = self.entries.keys().next().copied() {
            results.insert(id, self.collect(id));
        }
        results
    }

    #[instrument(level = "debug", skip_all, fields(future = %id))]
    fn collect(&mut self, id: FutureId) -> Result<T> {
        let mut pending = self
            .entries
            .remove(&id)
            .ok_or(ShmforkError::UnknownFuture(id))?;

        let reason = pending.proc.wait();
        let bytes = pending.segment.read_all();
        if let Err(e) = pending.segment.destroy() {
            warn!(error = %e, "Failed to destroy segment after collection");
        }
        debug!(worker = %pending.proc.pid(), %reason, "Worker collected");

        let outcome = match wire::decode_outcome::<T, C>(&bytes?) {
            Err(ShmforkError::Wire(WireError::Empty)) if !reason.is_success() => {
                Outcome::Failure(WorkerFailure::terminated(format!(
                    "worker {} {} before writing a result",
                    pending.proc.pid(),
                    reason
                )))
            }
            other => other?,
        };
        Ok(outcome.into_result()?)
    }
}

impl<T, C> fmt::Debug for Executor<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("total", &self.entries.len())
            .field("last_reap", &self.last_reap)
            .finish()
    }
}

impl<T, C> Drop for Executor<T, C> {
    fn drop(&mut self) {
        let closed = self.shutdown();
        if closed > 0 {
            debug!(closed, "Closed uncollected futures on drop");
        }
    }
}
