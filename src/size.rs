//! Byte size parsing and formatting.
//!
//! Segment capacities are configured as human-readable strings such as
//! `"64K"` or `"1KiB"`.

use std::fmt;
use std::str::FromStr;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Size in bytes with parsing and formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from kibibytes (KiB).
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * KIB)
    }

    /// Create from mebibytes (MiB).
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * MIB)
    }

    /// Get the raw byte count.
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Byte count as a `usize`, saturating on 32-bit targets.
    pub fn as_usize(&self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

/// Error returned when a size string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSizeError(String);

impl fmt::Display for ParseSizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid size: {}", self.0)
    }
}

impl std::error::Error for ParseSizeError {}

impl FromStr for ByteSize {
    type Err = ParseSizeError;

    /// Parse a size string.
    ///
    /// A plain number is a byte count. Suffixes `K`, `KB`, `KiB`, `M`, `MB`,
    /// `MiB`, `G`, `GB`, `GiB` are binary multiples and case insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseSizeError("empty string".into()));
        }

        let num_end = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        if num_end == 0 {
            return Err(ParseSizeError(format!("no numeric value in '{}'", s)));
        }

        let value: u64 = s[..num_end]
            .parse()
            .map_err(|_| ParseSizeError(format!("invalid number: '{}'", &s[..num_end])))?;

        let multiplier = match s[num_end..].trim().to_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => KIB,
            "m" | "mb" | "mib" => MIB,
            "g" | "gb" | "gib" => GIB,
            other => return Err(ParseSizeError(format!("unknown suffix: '{}'", other))),
        };

        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| ParseSizeError(format!("'{}' overflows", s)))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "0 bytes"),
            b if b % GIB == 0 => write!(f, "{} GiB", b / GIB),
            b if b % MIB == 0 => write!(f, "{} MiB", b / MIB),
            b if b % KIB == 0 => write!(f, "{} KiB", b / KIB),
            b => write!(f, "{} bytes", b),
        }
    }
}
