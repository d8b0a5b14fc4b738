//! Key-sharded spinlock.
//!
//! A fixed array of atomic slots provides per-key mutual exclusion for the
//! file tier. Distinct keys hashing to the same slot contend with each other;
//! that is accepted false sharing, not a correctness problem, and 512 slots
//! keeps the collision rate negligible at typical concurrency.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const DEFAULT_SLOTS: usize = 512;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Per-key spinlock over a fixed slot array.
pub struct ShardedSlotLock {
    slots: Box<[AtomicU32]>,
}

impl Default for ShardedSlotLock {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS)
    }
}

impl ShardedSlotLock {
    /// Create a lock with `len` slots. `len` must be non-zero.
    #[must_use]
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "slot array must be non-empty");
        Self {
            slots: (0..len).map(|_| AtomicU32::new(UNLOCKED)).collect(),
        }
    }

    fn slot_for(&self, key: &str) -> &AtomicU32 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.slots.len() as u64) as usize;
        // index < len by construction
        &self.slots[index]
    }

    /// Acquire the slot for `key`, spinning with escalating back-off: first
    /// a handful of scheduler yields, then 1 ms sleeps, then 20 ms sleeps.
    pub async fn lock(&self, key: &str) -> SlotGuard<'_> {
        let slot = self.slot_for(key);
        let mut attempts: u32 = 0;
        loop {
            if slot
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SlotGuard { slot };
            }
            attempts += 1;
            if attempts < 10 {
                tokio::task::yield_now().await;
            } else if attempts < 50 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

/// Scoped guard; dropping releases the slot on every exit path.
pub struct SlotGuard<'a> {
    slot: &'a AtomicU32,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.store(UNLOCKED, Ordering::Release);
    }
}
