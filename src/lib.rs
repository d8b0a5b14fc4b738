//! Layered Cache
//!
//! A three-tier cache facade fronting application code with a single typed
//! key/value interface:
//! - **L1**: in-process memory (Moka, size-bounded with per-key TTL)
//! - **L2**: local on-disk file cache (compact binary records, free-space
//!   self-limiting)
//! - **L3**: a distributed store (Redis by default), wrapped in a circuit
//!   breaker
//!
//! The tiers are coordinated: reads fall through L1 → L2 → L3, writes go
//! through all three, concurrent loads for the same key collapse to a single
//! factory execution, and key-change notifications from the distributed
//! store invalidate local copies across processes. TTLs are jittered upward
//! so entries written together do not expire together.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use layered_cache::{CacheConfig, CacheParameters, LayeredCache};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CacheConfig::default()
//!         .with_key_prefix("orders")
//!         .with_distributed_endpoint("redis://127.0.0.1:6379");
//!     let cache = LayeredCache::new(config).await?;
//!
//!     cache
//!         .set(
//!             "user:1",
//!             &"alice".to_string(),
//!             CacheParameters::with_duration(Duration::from_secs(300)),
//!         )
//!         .await?;
//!
//!     let name: Option<String> = cache.get("user:1").await?;
//!     println!("cached: {name:?}");
//!
//!     // Collapsed load: under concurrency the factory runs once.
//!     let loaded = cache
//!         .get_or_create("user:2", |_ctx| async {
//!             Ok(Some("bob".to_string()))
//!         })
//!         .await?;
//!     println!("loaded: {loaded:?}");
//!
//!     cache.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Degradation
//!
//! The cache degrades instead of failing: disk-tier I/O errors and
//! distributed GET/SET failures are logged and observed as misses, corrupt
//! disk records are deleted on sight, and a repeatedly failing distributed
//! store trips a circuit breaker so calls fail fast until a cool-down
//! passes. Distributed *deletes* do surface errors, since hiding one would let
//! read-through resurrect the deleted value.

pub mod backends;
pub mod breaker;
pub mod clock;
pub mod codecs;
pub mod config;
pub mod coordinator;
pub mod disk_space;
pub mod distributed;
pub mod error;
pub mod file_cache;
pub mod jitter;
pub mod key;
pub mod memory_tier;
pub mod shard_lock;
mod single_flight;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codecs::JsonCodec;
pub use config::{CacheConfig, CacheParameters, FLUSH_ALL_SENTINEL, TEMP_DIR_SENTINEL};
pub use coordinator::{CreateContext, LayeredCache, LayeredCacheStats};
pub use disk_space::{DiskSpace, SysDiskSpace};
pub use distributed::{DistributedCacheAdapter, DistributedLock};
pub use error::CacheError;
pub use file_cache::{FileCache, FileCacheItem, FilePayload};
pub use key::KeyFormatter;
pub use memory_tier::MemoryTier;
pub use traits::{DistributedItem, Serializer, Store};

#[cfg(feature = "redis")]
pub use backends::RedisStore;

// Re-export for implementing `Store` without a separate dependency.
pub use async_trait::async_trait;
