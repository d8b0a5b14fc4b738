//! Memory tier (L1).
//!
//! Moka-backed in-process map holding serialized values with per-key TTL and
//! byte-cost accounting. The moka weigher charges each entry's caller-supplied
//! size estimate against the configured byte cap, so an entry larger than the
//! cap is evicted straight away and the value is served from the disk tier
//! instead. Expiry is judged against the injected [`Clock`], like every other
//! tier, so tests drive L1 expiration deterministically.

use crate::clock::Clock;
use bytes::Bytes;
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Entry with its own expiry; moka's global TTL is only a safety net.
#[derive(Debug, Clone)]
struct MemoryEntry {
    bytes: Bytes,
    expires_at: SystemTime,
    size: u32,
}

impl MemoryEntry {
    fn is_expired(&self, now: SystemTime) -> bool {
        now > self.expires_at
    }
}

/// Size-bounded in-RAM tier.
pub struct MemoryTier {
    cache: Cache<String, MemoryEntry>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryTier {
    /// Create a tier capped at `max_bytes` of estimated entry cost.
    #[must_use]
    pub fn new(max_bytes: u64, clock: Arc<dyn Clock>) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &String, entry: &MemoryEntry| entry.size.max(1))
            .time_to_live(Duration::from_secs(24 * 3600))
            .build();

        Self {
            cache,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Read a key. Expired entries are removed and reported as misses.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        match self.cache.get(key).await {
            Some(entry) if entry.is_expired(self.clock.now()) => {
                self.cache.invalidate(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.bytes)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether the key is currently resident and unexpired. Does not touch
    /// hit/miss counters; used to observe eviction without side effects.
    pub async fn contains(&self, key: &str) -> bool {
        self.cache
            .get(key)
            .await
            .is_some_and(|entry| !entry.is_expired(self.clock.now()))
    }

    /// Insert with an absolute expiry of `now + ttl`, charging `size` bytes.
    ///
    /// Pending eviction work is flushed before returning so a write that
    /// blows the cap is observable as an immediate eviction.
    pub async fn set(&self, key: &str, bytes: Bytes, ttl: Duration, size: u32) {
        let entry = MemoryEntry {
            bytes,
            expires_at: self.clock.now() + ttl,
            size,
        };
        self.cache.insert(key.to_string(), entry).await;
        self.cache.run_pending_tasks().await;
        tracing::trace!(key, size, ttl_secs = ttl.as_secs(), "memory tier set");
    }

    pub async fn remove(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Drop every entry; the `__flushall__` handler compacts at 100%.
    pub async fn clear_all(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        tracing::debug!("memory tier cleared");
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    fn tier_with_manual_clock(max_bytes: u64) -> (MemoryTier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let tier = MemoryTier::new(max_bytes, Arc::clone(&clock) as Arc<dyn Clock>);
        (tier, clock)
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let (tier, _clock) = tier_with_manual_clock(1024);
        tier.set("k", Bytes::from_static(b"v"), Duration::from_secs(60), 16)
            .await;
        assert_eq!(tier.get("k").await, Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn expired_entries_report_misses() {
        let (tier, clock) = tier_with_manual_clock(1024);
        tier.set("k", Bytes::from_static(b"v"), Duration::from_secs(30), 16)
            .await;
        assert_eq!(tier.get("k").await, Some(Bytes::from_static(b"v")));

        clock.advance(Duration::from_secs(31));
        assert_eq!(tier.get("k").await, None);
        assert!(!tier.contains("k").await);
    }

    #[tokio::test]
    async fn oversize_entry_is_evicted_immediately() {
        let tier = MemoryTier::new(100_000, Arc::new(SystemClock));
        tier.set("small", Bytes::from_static(b"a"), Duration::from_secs(60), 75_000)
            .await;
        assert!(tier.contains("small").await);

        tier.set("big", Bytes::from_static(b"b"), Duration::from_secs(60), 175_000)
            .await;
        assert!(
            !tier.contains("big").await,
            "entry above the byte cap must not stay resident"
        );
        assert!(tier.contains("small").await, "entries under the cap survive");
    }

    #[tokio::test]
    async fn clear_all_empties_the_tier() {
        let (tier, _clock) = tier_with_manual_clock(1024);
        tier.set("a", Bytes::from_static(b"1"), Duration::from_secs(60), 8)
            .await;
        tier.set("b", Bytes::from_static(b"2"), Duration::from_secs(60), 8)
            .await;
        tier.clear_all().await;
        assert!(!tier.contains("a").await);
        assert!(!tier.contains("b").await);
    }
}
