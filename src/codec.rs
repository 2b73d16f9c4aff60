//! Payload codecs.
//!
//! The wire frame only fixes the length prefix and outcome tag; the body is
//! produced by a [`Codec`] chosen per executor.

use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Serialization capability used for outcome bodies.
pub trait Codec {
    /// Short name for logging.
    const NAME: &'static str;

    /// Serialize a value to bytes.
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

/// JSON bodies via `serde_json`.
///
/// Needed for self-describing targets such as `serde_json::Value`, which
/// bincode cannot decode. JSON is lossy for some Rust values:
///
/// - non-finite floats encode as `null` and then fail to decode;
/// - `Some(None)` encodes as `null` and decodes as `None`.
///
/// Use [`BincodeCodec`] (the default) when results may contain either.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    const NAME: &'static str = "json";

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary bodies via `bincode`. The executor default: every value
/// serde can describe without `deserialize_any` round-trips exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    const NAME: &'static str = "bincode";

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}
