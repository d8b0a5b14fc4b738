//! Cache configuration and per-entry parameters.

use std::time::Duration;

/// Sentinel accepted in [`CacheConfig::file_directory`] meaning "use the
/// system temp directory". Matched case-insensitively.
pub const TEMP_DIR_SENTINEL: &str = "%temp%";

/// Key received on the change channel that requests a full local purge.
pub const FLUSH_ALL_SENTINEL: &str = "__flushall__";

fn default_key_prefix() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "app".to_string())
}

/// Configuration for a [`LayeredCache`](crate::LayeredCache).
///
/// An empty `file_directory` disables the disk tier; an empty
/// `distributed_endpoint` disables the distributed tier. The cache always
/// runs with at least the memory tier.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// First segment of every formatted key. May be empty to share keys
    /// across services.
    pub key_prefix: String,
    /// Memory tier size cap in bytes, charged from per-entry size estimates.
    pub max_memory_bytes: u64,
    /// Distributed store connection string. Empty disables the tier.
    pub distributed_endpoint: String,
    /// Disk tier root, or [`TEMP_DIR_SENTINEL`]. Empty disables the tier.
    pub file_directory: String,
    /// Free-space percentage below which the disk tier starts reclaiming.
    pub file_free_space_threshold_pct: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            max_memory_bytes: 1024 * 1024 * 1024,
            distributed_endpoint: String::new(),
            file_directory: TEMP_DIR_SENTINEL.to_string(),
            file_free_space_threshold_pct: 15,
        }
    }
}

impl CacheConfig {
    /// Set the key prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the memory tier size cap.
    #[must_use]
    pub fn with_max_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Set the distributed store endpoint.
    #[must_use]
    pub fn with_distributed_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.distributed_endpoint = endpoint.into();
        self
    }

    /// Set the disk tier root directory.
    #[must_use]
    pub fn with_file_directory(mut self, dir: impl Into<String>) -> Self {
        self.file_directory = dir.into();
        self
    }

    /// Set the free-space reclaim threshold.
    #[must_use]
    pub fn with_file_free_space_threshold_pct(mut self, pct: u8) -> Self {
        self.file_free_space_threshold_pct = pct;
        self
    }
}

/// Per-entry cache parameters: how long the value lives and how many bytes
/// it is charged for in the memory tier. The size estimate is ignored by the
/// disk and distributed tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheParameters {
    /// Time to live. Zero is coerced to the default.
    pub duration: Duration,
    /// Estimated byte cost for memory tier accounting.
    pub size: u32,
}

pub(crate) const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
pub(crate) const DEFAULT_SIZE: u32 = 128;

impl Default for CacheParameters {
    fn default() -> Self {
        Self {
            duration: DEFAULT_TTL,
            size: DEFAULT_SIZE,
        }
    }
}

impl CacheParameters {
    /// Create parameters, coercing a zero duration to the 30 minute default.
    #[must_use]
    pub fn new(duration: Duration, size: u32) -> Self {
        Self {
            duration: if duration.is_zero() {
                DEFAULT_TTL
            } else {
                duration
            },
            size,
        }
    }

    /// Parameters with the given duration and the default size estimate.
    #[must_use]
    pub fn with_duration(duration: Duration) -> Self {
        Self::new(duration, DEFAULT_SIZE)
    }
}
