//! SysV shared memory segments.
//!
//! A [`Segment`] is created by the parent, inherited (already attached) by
//! the forked worker, written once by the worker, then read and destroyed by
//! the parent. Keys come from a [`KeySource`]; the default [`FtokKeys`]
//! combines a namespace path with a random one-byte discriminator.

use crate::error::{Result, ShmforkError};
use nix::errno::Errno;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Default number of key attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 10;

/// Errors from operating on an acquired segment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("segment {0} has already been released")]
    Released(i32),

    #[error("write of {len} bytes at offset {offset} exceeds segment size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("{op} failed on segment {id}: {errno}")]
    Os {
        op: &'static str,
        id: i32,
        errno: Errno,
    },
}

/// Copyable description of a segment, exposed on future handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Kernel identifier returned by `shmget`.
    pub shm_id: i32,
    /// IPC key the segment was created under.
    pub key: libc::key_t,
    /// Size in bytes.
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Attached,
    Detached,
    Destroyed,
}

/// An attached SysV shared memory segment.
///
/// Dropping a segment that has not been destroyed removes it from the
/// system; [`Segment::destroy`] is idempotent.
#[derive(Debug)]
pub struct Segment {
    info: SegmentInfo,
    addr: NonNull<u8>,
    state: State,
}

impl Segment {
    /// Create a brand new segment under `key` and attach it.
    ///
    /// Uses `IPC_CREAT | IPC_EXCL`, so an existing segment with the same key
    /// is reported as `EEXIST` instead of being reused.
    pub fn create(key: libc::key_t, size: usize, permissions: u32) -> std::result::Result<Self, Errno> {
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | (permissions & 0o777) as libc::c_int;
        // SAFETY: shmget takes no pointers.
        let shm_id = unsafe { libc::shmget(key, size, flags) };
        if shm_id < 0 {
            return Err(Errno::last());
        }

        // SAFETY: a null address lets the kernel pick the mapping.
        let raw = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        if raw as isize == -1 {
            let errno = Errno::last();
            // SAFETY: the id was created above and nothing is attached to it.
            unsafe { libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut()) };
            return Err(errno);
        }

        let addr = NonNull::new(raw.cast::<u8>()).ok_or(Errno::EINVAL)?;
        Ok(Self {
            info: SegmentInfo { shm_id, key, size },
            addr,
            state: State::Attached,
        })
    }

    pub fn info(&self) -> SegmentInfo {
        self.info
    }

    pub fn len(&self) -> usize {
        self.info.size
    }

    pub fn is_empty(&self) -> bool {
        self.info.size == 0
    }

    pub fn is_released(&self) -> bool {
        self.state != State::Attached
    }

    fn ensure_attached(&self) -> std::result::Result<(), SegmentError> {
        match self.state {
            State::Attached => Ok(()),
            _ => Err(SegmentError::Released(self.info.shm_id)),
        }
    }

    /// Copy `data` into the segment at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> std::result::Result<(), SegmentError> {
        self.ensure_attached()?;
        let size = self.info.size;
        if offset.checked_add(data.len()).is_none_or(|end| end > size) {
            return Err(SegmentError::OutOfBounds {
                offset,
                len: data.len(),
                size,
            });
        }
        // SAFETY: the mapping is attached, `size` bytes long, and the range
        // was bounds-checked above.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.addr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy the whole segment out.
    pub fn read_all(&self) -> std::result::Result<Vec<u8>, SegmentError> {
        self.ensure_attached()?;
        // SAFETY: the mapping is attached and `size` bytes long. The writer
        // has exited before the parent reads.
        let bytes = unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.info.size) };
        Ok(bytes.to_vec())
    }

    /// Detach this process's mapping without removing the segment.
    ///
    /// This is the worker's release: the parent's mapping and the segment
    /// contents are unaffected.
    pub fn detach(&mut self) -> std::result::Result<(), SegmentError> {
        if self.state != State::Attached {
            return Ok(());
        }
        // SAFETY: addr came from shmat and is still attached.
        if unsafe { libc::shmdt(self.addr.as_ptr().cast()) } != 0 {
            return Err(SegmentError::Os {
                op: "shmdt",
                id: self.info.shm_id,
                errno: Errno::last(),
            });
        }
        self.state = State::Detached;
        Ok(())
    }

    /// Detach and remove the segment. Calling this again is a no-op.
    pub fn destroy(&mut self) -> std::result::Result<(), SegmentError> {
        if self.state == State::Destroyed {
            return Ok(());
        }
        let detached = self.detach();

        // SAFETY: IPC_RMID ignores the buffer argument.
        let rc = unsafe { libc::shmctl(self.info.shm_id, libc::IPC_RMID, ptr::null_mut()) };
        self.state = State::Destroyed;
        if rc != 0 {
            return Err(SegmentError::Os {
                op: "shmctl(IPC_RMID)",
                id: self.info.shm_id,
                errno: Errno::last(),
            });
        }
        trace!(shm_id = self.info.shm_id, "Segment destroyed");
        detached
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.state != State::Destroyed
            && let Err(e) = self.destroy()
        {
            warn!(shm_id = self.info.shm_id, error = %e, "Failed to release segment on drop");
        }
    }
}

/// Produces candidate IPC keys for segment creation.
pub trait KeySource {
    fn next_key(&mut self) -> std::result::Result<libc::key_t, Errno>;
}

/// `ftok(path, n)` with `n` drawn at random from `1..=255`.
pub struct FtokKeys {
    path: CString,
    rng: StdRng,
}

impl FtokKeys {
    /// Keys namespaced by `path`, which must exist.
    pub fn new(path: &Path) -> Result<Self> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| ShmforkError::Config(format!("key path {} contains NUL", path.display())))?;
        Ok(Self {
            path,
            rng: StdRng::from_entropy(),
        })
    }

    /// Keys namespaced by the running executable, or the temp dir if that
    /// cannot be determined.
    pub fn for_current_exe() -> Result<Self> {
        let path = std::env::current_exe().unwrap_or_else(|_| std::env::temp_dir());
        Self::new(&path)
    }
}

impl KeySource for FtokKeys {
    fn next_key(&mut self) -> std::result::Result<libc::key_t, Errno> {
        let discriminator: u8 = self.rng.gen_range(1..=255);
        // SAFETY: path is a valid NUL-terminated string.
        let key = unsafe { libc::ftok(self.path.as_ptr(), libc::c_int::from(discriminator)) };
        if key == -1 {
            return Err(Errno::last());
        }
        Ok(key)
    }
}

/// Creates segments, regenerating the key on every failed attempt.
pub struct SegmentAllocator {
    keys: Box<dyn KeySource>,
    max_attempts: usize,
}

impl SegmentAllocator {
    pub fn new(keys: Box<dyn KeySource>, max_attempts: usize) -> Self {
        Self { keys, max_attempts }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Create a segment of `size` bytes with `permissions`.
    ///
    /// Fails with [`ShmforkError::ResourceExhausted`] once `max_attempts`
    /// keys have been tried.
    pub fn acquire(&mut self, size: usize, permissions: u32) -> Result<Segment> {
        let mut last = Errno::EEXIST;

        for attempt in 1..=self.max_attempts {
            let key = match self.keys.next_key() {
                Ok(key) => key,
                Err(errno) => {
                    trace!(attempt, %errno, "Key derivation failed");
                    last = errno;
                    continue;
                }
            };

            match Segment::create(key, size, permissions) {
                Ok(segment) => {
                    debug!(
                        attempt,
                        key,
                        shm_id = segment.info().shm_id,
                        size,
                        "Acquired shared memory segment"
                    );
                    return Ok(segment);
                }
                Err(errno) => {
                    trace!(attempt, key, %errno, "Segment creation refused, retrying with new key");
                    last = errno;
                }
            }
        }

        warn!(attempts = self.max_attempts, %last, "Shared memory segment acquisition exhausted");
        Err(ShmforkError::ResourceExhausted {
            attempts: self.max_attempts,
            last,
        })
    }
}
