//! Code that runs inside the forked worker process.
//!
//! The worker runs the work item, writes exactly one frame at offset 0 of
//! its segment, detaches, and exits with status 0. It never returns into the
//! caller's code and never runs destructors inherited from the parent.

use crate::codec::Codec;
use crate::segment::Segment;
use crate::wire::{self, Outcome, WorkerFailure};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Run `work` and exit the process.
pub(crate) fn run<T, C, F, E>(mut segment: Segment, work: F) -> !
where
    T: Serialize,
    C: Codec,
    F: FnOnce() -> Result<T, E>,
    E: fmt::Display,
{
    let pid = std::process::id();
    debug!(pid, shm_id = segment.info().shm_id, codec = C::NAME, "Executing work item");

    let completed = panic::catch_unwind(AssertUnwindSafe(|| complete::<T, C, F, E>(&mut segment, work)));
    if completed.is_err() {
        error!(pid, "Worker panicked while reporting a panic; no outcome written");
    }

    debug!(pid, "Releasing segment and exiting");
    if let Err(e) = segment.detach() {
        warn!(pid, error = %e, "Failed to detach segment in worker");
    }
    // The parent owns removal of the segment.
    std::mem::forget(segment);

    // SAFETY: _exit skips atexit handlers and stdio flushing inherited from
    // the parent, which must only run once.
    unsafe { libc::_exit(0) }
}

/// Run `work` and write its outcome.
///
/// A panic after the work item returns, such as one raised by `T`'s
/// `Serialize` impl, is written as a [`FailureKind::Panic`] failure.
///
/// [`FailureKind::Panic`]: crate::wire::FailureKind::Panic
fn complete<T, C, F, E>(segment: &mut Segment, work: F)
where
    T: Serialize,
    C: Codec,
    F: FnOnce() -> Result<T, E>,
    E: fmt::Display,
{
    let executed = panic::catch_unwind(AssertUnwindSafe(|| execute::<T, C, F, E>(segment, work)));
    if let Err(payload) = executed {
        let failure = WorkerFailure::from_panic(payload.as_ref());
        error!(pid = std::process::id(), message = %failure.message, "Worker panicked outside the work item");
        let capacity = segment.len();
        write_frame(segment, failure_frame::<C>(failure, capacity));
    }
}

fn execute<T, C, F, E>(segment: &mut Segment, work: F)
where
    T: Serialize,
    C: Codec,
    F: FnOnce() -> Result<T, E>,
    E: fmt::Display,
{
    let pid = std::process::id();
    let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => Outcome::Success(value),
        Ok(Err(e)) => {
            error!(pid, error = %e, "Work item returned an error");
            Outcome::Failure(WorkerFailure::from_error(&e))
        }
        Err(payload) => {
            let failure = WorkerFailure::from_panic(payload.as_ref());
            error!(pid, message = %failure.message, "Work item panicked");
            Outcome::Failure(failure)
        }
    };

    let capacity = segment.len();
    let frame = match wire::encode_outcome::<T, C>(&outcome) {
        Ok(frame) if frame.len() <= capacity => Some(frame),
        Ok(frame) => {
            warn!(pid, frame_len = frame.len(), capacity, "Outcome does not fit in segment");
            failure_frame::<C>(WorkerFailure::overflow(frame.len(), capacity), capacity)
        }
        Err(e) => {
            warn!(pid, error = %e, "Failed to encode outcome");
            failure_frame::<C>(WorkerFailure::encode(e.to_string()), capacity)
        }
    };

    write_frame(segment, frame);
}

fn write_frame(segment: &mut Segment, frame: Option<Vec<u8>>) {
    let pid = std::process::id();
    match frame {
        Some(frame) => {
            if let Err(e) = segment.write_at(0, &frame) {
                error!(pid, error = %e, "Failed to write outcome to segment");
            } else {
                debug!(pid, frame_len = frame.len(), "Outcome written");
            }
        }
        None => error!(pid, capacity = segment.len(), "Segment too small for any outcome"),
    }
}

/// Encode a failure, or `None` if even that does not fit.
fn failure_frame<C: Codec>(failure: WorkerFailure, capacity: usize) -> Option<Vec<u8>> {
    wire::encode_outcome::<(), C>(&Outcome::Failure(failure))
        .ok()
        .filter(|frame| frame.len() <= capacity)
}
