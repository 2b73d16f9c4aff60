//! Wire format for outcomes passed from worker to parent.
//!
//! A frame is a native-endian `u32` payload length followed by the payload.
//! The first payload byte is the outcome kind; the rest is the codec body:
//!
//! ```text
//! +----------------+------+---------------------+
//! | len: u32 (ne)  | kind | body (len - 1 bytes) |
//! +----------------+------+---------------------+
//! ```
//!
//! Bytes after the payload are never read.

use crate::codec::Codec;
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Smallest segment that can hold a non-empty frame.
pub const MIN_SEGMENT_SIZE: usize = LEN_PREFIX + 1;

/// Largest segment whose whole payload a `u32` prefix can describe.
pub const MAX_SEGMENT_SIZE: u64 = u32::MAX as u64 + LEN_PREFIX as u64;

const KIND_SUCCESS: u8 = 0x00;
const KIND_FAILURE: u8 = 0x01;

/// Framing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("segment is empty (worker wrote no outcome)")]
    Empty,

    #[error("frame truncated: declared {declared} bytes, {available} available")]
    Truncated { declared: usize, available: usize },

    #[error("unknown outcome kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("payload of {0} bytes does not fit a u32 length prefix")]
    TooLarge(usize),
}

/// Broad classification of a worker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The work item returned `Err`.
    Error,
    /// The work item panicked.
    Panic,
    /// The encoded result did not fit in the segment.
    Overflow,
    /// The result could not be serialized.
    Encode,
    /// The worker died without writing an outcome.
    Terminated,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Panic => "panic",
            Self::Overflow => "overflow",
            Self::Encode => "encode",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A failure captured in a worker and re-raised at collection time.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} ({category}): {message}")]
pub struct WorkerFailure {
    pub kind: FailureKind,
    /// Error type name for [`FailureKind::Error`], otherwise the kind name.
    pub category: String,
    pub message: String,
}

impl WorkerFailure {
    pub fn new(kind: FailureKind, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            category: category.into(),
            message: message.into(),
        }
    }

    /// Capture an error returned by a work item.
    pub fn from_error<E: fmt::Display>(err: &E) -> Self {
        Self::new(FailureKind::Error, std::any::type_name::<E>(), err.to_string())
    }

    /// Capture a panic payload from `catch_unwind`.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(FailureKind::Panic, "panic", message)
    }

    fn of_kind(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::new(kind, kind.to_string(), message)
    }

    pub fn overflow(frame_len: usize, capacity: usize) -> Self {
        Self::of_kind(
            FailureKind::Overflow,
            format!("encoded outcome is {frame_len} bytes but the segment holds {capacity}"),
        )
    }

    pub fn encode(message: impl Into<String>) -> Self {
        Self::of_kind(FailureKind::Encode, message)
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        Self::of_kind(FailureKind::Terminated, message)
    }
}

/// Terminal result of one work item.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Failure(WorkerFailure),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn into_result(self) -> std::result::Result<T, WorkerFailure> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(failure) => Err(failure),
        }
    }
}

/// Wrap an already-tagged payload in a length prefix.
fn frame(kind: u8, body: &[u8]) -> std::result::Result<Vec<u8>, WireError> {
    let payload_len = body.len().saturating_add(1);
    let prefix = u32::try_from(payload_len).map_err(|_| WireError::TooLarge(payload_len))?;
    let mut out = Vec::with_capacity(LEN_PREFIX + payload_len);
    out.extend_from_slice(&prefix.to_ne_bytes());
    out.push(kind);
    out.extend_from_slice(body);
    Ok(out)
}

/// Split a frame into its kind byte and body, ignoring trailing bytes.
pub fn read_frame(buf: &[u8]) -> std::result::Result<(u8, &[u8]), WireError> {
    let prefix: [u8; LEN_PREFIX] = buf
        .get(..LEN_PREFIX)
        .and_then(|p| p.try_into().ok())
        .ok_or(WireError::Truncated {
            declared: LEN_PREFIX,
            available: buf.len(),
        })?;

    let declared = u32::from_ne_bytes(prefix) as usize;
    if declared == 0 {
        return Err(WireError::Empty);
    }

    let available = buf.len() - LEN_PREFIX;
    let payload = LEN_PREFIX
        .checked_add(declared)
        .and_then(|end| buf.get(LEN_PREFIX..end))
        .ok_or(WireError::Truncated {
            declared,
            available,
        })?;

    Ok((payload[0], &payload[1..]))
}

/// Encode an outcome into a complete frame.
pub fn encode_outcome<T: Serialize, C: Codec>(outcome: &Outcome<T>) -> Result<Vec<u8>> {
    let (kind, body) = match outcome {
        Outcome::Success(value) => (KIND_SUCCESS, C::encode(value)?),
        Outcome::Failure(failure) => (KIND_FAILURE, C::encode(failure)?),
    };
    Ok(frame(kind, &body)?)
}

/// Decode a frame produced by [`encode_outcome`] with the same codec.
pub fn decode_outcome<T: DeserializeOwned, C: Codec>(buf: &[u8]) -> Result<Outcome<T>> {
    let (kind, body) = read_frame(buf)?;
    match kind {
        KIND_SUCCESS => Ok(Outcome::Success(C::decode(body)?)),
        KIND_FAILURE => Ok(Outcome::Failure(C::decode(body)?)),
        other => Err(WireError::UnknownKind(other).into()),
    }
}
