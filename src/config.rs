//! Executor configuration.
//!
//! # Environment Variables
//!
//! - `SHMFORK_SEGMENT_SIZE` - Segment capacity, e.g. `64K`, `1KiB`, `4096`
//! - `SHMFORK_SEGMENT_PERMS` - Octal permission bits, e.g. `0600`
//! - `SHMFORK_REAP_INTERVAL_SECS` - Minimum seconds between reap passes
//! - `SHMFORK_KEY_PATH` - Existing file used to namespace segment keys

use crate::error::{Result, ShmforkError};
use crate::segment::DEFAULT_MAX_ATTEMPTS;
use crate::size::ByteSize;
use crate::wire::{MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE};
use std::path::PathBuf;
use std::time::Duration;

/// Default segment capacity.
pub const DEFAULT_SEGMENT_SIZE: ByteSize = ByteSize::from_kib(64);

/// Segment capacity of the compact profile.
pub const COMPACT_SEGMENT_SIZE: ByteSize = ByteSize::from_kib(1);

/// Default segment permission bits.
pub const DEFAULT_PERMISSIONS: u32 = 0o644;

/// Default minimum time between reap passes.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(8);

/// Default time a worker gets to exit after SIGTERM before SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(100);

/// Which unfinished futures a reap pass closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReapPolicy {
    /// Close every unfinished future.
    #[default]
    Sweep,
    /// Close unfinished futures dispatched longer ago than the given duration.
    OlderThan(Duration),
}

/// Settings read by the executor at dispatch and reap time.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Capacity of each worker's result segment.
    pub segment_size: ByteSize,
    /// Permission bits for new segments.
    pub permissions: u32,
    /// File used to namespace keys (None = current executable).
    pub key_path: Option<PathBuf>,
    /// Key attempts before `ResourceExhausted`.
    pub max_attempts: usize,
    /// Minimum time between reap passes.
    pub reap_interval: Duration,
    pub reap_policy: ReapPolicy,
    /// Time between SIGTERM and SIGKILL when closing a future.
    pub kill_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            permissions: DEFAULT_PERMISSIONS,
            key_path: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reap_interval: DEFAULT_REAP_INTERVAL,
            reap_policy: ReapPolicy::Sweep,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for small results (1 KiB segments).
    pub fn compact() -> Self {
        Self::default().with_segment_size(COMPACT_SEGMENT_SIZE)
    }

    /// Set the capacity of each worker's result segment.
    pub fn with_segment_size(mut self, size: ByteSize) -> Self {
        self.segment_size = size;
        self
    }

    /// Set the permission bits for new segments.
    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions;
        self
    }

    /// Namespace segment keys by an existing file.
    pub fn with_key_path(mut self, path: PathBuf) -> Self {
        self.key_path = Some(path);
        self
    }

    /// Set how many keys are tried before giving up.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the minimum time between reap passes.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set which unfinished futures a reap pass closes.
    pub fn with_reap_policy(mut self, policy: ReapPolicy) -> Self {
        self.reap_policy = policy;
        self
    }

    /// Set how long a closed worker gets between SIGTERM and SIGKILL.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Unparseable values are an error rather than silently ignored.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(size) = std::env::var("SHMFORK_SEGMENT_SIZE") {
            self.segment_size = size
                .parse()
                .map_err(|e| ShmforkError::Config(format!("SHMFORK_SEGMENT_SIZE: {}", e)))?;
        }

        if let Ok(perms) = std::env::var("SHMFORK_SEGMENT_PERMS") {
            self.permissions = parse_permissions(&perms)?;
        }

        if let Ok(secs) = std::env::var("SHMFORK_REAP_INTERVAL_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                ShmforkError::Config(format!("SHMFORK_REAP_INTERVAL_SECS: invalid number '{}'", secs))
            })?;
            self.reap_interval = Duration::from_secs(secs);
        }

        if let Ok(path) = std::env::var("SHMFORK_KEY_PATH") {
            self.key_path = Some(PathBuf::from(path));
        }

        Ok(self)
    }

    /// Check that the configuration can produce working segments.
    pub fn validate(&self) -> Result<()> {
        if self.segment_size.as_usize() < MIN_SEGMENT_SIZE {
            return Err(ShmforkError::Config(format!(
                "segment size {} is below the {} byte minimum",
                self.segment_size, MIN_SEGMENT_SIZE
            )));
        }
        if self.segment_size.as_bytes() > MAX_SEGMENT_SIZE {
            return Err(ShmforkError::Config(format!(
                "segment size {} exceeds the {} byte frame limit",
                self.segment_size, MAX_SEGMENT_SIZE
            )));
        }
        if self.permissions & !0o777 != 0 {
            return Err(ShmforkError::Config(format!(
                "permissions {:o} contain bits outside 0777",
                self.permissions
            )));
        }
        if self.max_attempts == 0 {
            return Err(ShmforkError::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parse octal permission bits such as `0644`, `644` or `0o600`.
pub fn parse_permissions(s: &str) -> Result<u32> {
    let s = s.trim();
    let digits = s.strip_prefix("0o").unwrap_or(s);
    u32::from_str_radix(digits, 8)
        .map_err(|_| ShmforkError::Config(format!("invalid octal permissions '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.segment_size.as_bytes(), 65536);
        assert_eq!(config.permissions, 0o644);
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.reap_interval, Duration::from_secs(8));
        assert_eq!(config.reap_policy, ReapPolicy::Sweep);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_compact_profile() {
        assert_eq!(ExecutorConfig::compact().segment_size.as_bytes(), 1024);
    }

    #[test]
    fn test_builder() {
        let config = ExecutorConfig::new()
            .with_segment_size(ByteSize::from_kib(4))
            .with_permissions(0o600)
            .with_key_path(PathBuf::from("/tmp"))
            .with_reap_policy(ReapPolicy::OlderThan(Duration::from_secs(30)))
            .with_kill_grace(Duration::ZERO);

        assert_eq!(config.segment_size.as_bytes(), 4096);
        assert_eq!(config.permissions, 0o600);
        assert_eq!(config.key_path, Some(PathBuf::from("/tmp")));
        assert_eq!(config.reap_policy, ReapPolicy::OlderThan(Duration::from_secs(30)));
        assert_eq!(config.kill_grace, Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let tiny = ExecutorConfig::new().with_segment_size(ByteSize::from_bytes(4));
        assert!(tiny.validate().is_err());

        let perms = ExecutorConfig::new().with_permissions(0o4755);
        assert!(perms.validate().is_err());

        let attempts = ExecutorConfig::new().with_max_attempts(0);
        assert!(attempts.validate().is_err());
    }

    #[test]
    fn test_validate_segment_size_frame_limit() {
        let largest = ExecutorConfig::new().with_segment_size(ByteSize::from_bytes(MAX_SEGMENT_SIZE));
        assert!(largest.validate().is_ok());

        let too_large =
            ExecutorConfig::new().with_segment_size(ByteSize::from_bytes(MAX_SEGMENT_SIZE + 1));
        let err = too_large.validate().unwrap_err();
        assert!(err.to_string().contains("frame limit"));
    }

    #[test]
    fn test_parse_permissions() {
        assert_eq!(parse_permissions("0644").unwrap(), 0o644);
        assert_eq!(parse_permissions("600").unwrap(), 0o600);
        assert_eq!(parse_permissions("0o700").unwrap(), 0o700);
        assert!(parse_permissions("0988").is_err());
        assert!(parse_permissions("rw").is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: serialized with the other env-mutating tests.
        unsafe {
            std::env::set_var("SHMFORK_SEGMENT_SIZE", "8K");
            std::env::set_var("SHMFORK_SEGMENT_PERMS", "0600");
            std::env::set_var("SHMFORK_REAP_INTERVAL_SECS", "2");
        }
        let config = ExecutorConfig::default().with_env_overrides().unwrap();
        unsafe {
            std::env::remove_var("SHMFORK_SEGMENT_SIZE");
            std::env::remove_var("SHMFORK_SEGMENT_PERMS");
            std::env::remove_var("SHMFORK_REAP_INTERVAL_SECS");
        }

        assert_eq!(config.segment_size, ByteSize::from_kib(8));
        assert_eq!(config.permissions, 0o600);
        assert_eq!(config.reap_interval, Duration::from_secs(2));
    }

    #[test]
    #[serial]
    fn test_env_override_errors() {
        unsafe { std::env::set_var("SHMFORK_SEGMENT_SIZE", "lots") };
        let result = ExecutorConfig::default().with_env_overrides();
        unsafe { std::env::remove_var("SHMFORK_SEGMENT_SIZE") };
        assert!(matches!(result, Err(ShmforkError::Config(_))));
    }
}
