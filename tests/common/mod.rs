//! Shared test infrastructure: an in-memory `Store` with scriptable
//! failures and a notification injector, plus cache construction helpers.

// Each test binary compiles this module; not all of them use every helper.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use bytes::Bytes;
use dashmap::DashMap;
use layered_cache::{
    async_trait, CacheConfig, DistributedItem, JsonCodec, LayeredCache, Serializer, Store,
    SystemClock, SysDiskSpace,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// In-memory distributed store for tests. Failures are injected per-call;
/// key-change notifications are pushed by the test through `publish`.
#[derive(Default)]
pub struct MockStore {
    items: DashMap<String, (Bytes, SystemTime)>,
    locks: DashMap<String, (String, SystemTime)>,
    notify_tx: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
    fail_next: AtomicU32,
    fail_message: parking_lot::Mutex<String>,
    pub get_calls: AtomicU32,
    pub set_calls: AtomicU32,
    pub delete_calls: AtomicU32,
    pub subscribe_calls: AtomicU32,
    pub reconnects: AtomicU32,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        let store = Self::default();
        *store.fail_message.lock() = "synthetic outage".to_string();
        Arc::new(store)
    }

    /// Make the next `n` store calls fail with `message`.
    pub fn fail_next(&self, n: u32, message: &str) {
        *self.fail_message.lock() = message.to_string();
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Push a raw key-change notification (envelope included) to the
    /// subscriber, if any.
    pub async fn publish(&self, raw: &str) {
        let tx = self.notify_tx.lock().clone();
        if let Some(tx) = tx {
            tx.send(raw.to_string()).await.expect("subscriber alive");
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// Drop a stored value without going through `delete` (and its failure
    /// injection / call counting).
    pub fn items_remove(&self, key: &str) {
        self.items.remove(key);
    }

    fn check_failure(&self) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("{}", self.fail_message.lock().clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MockStore {
    async fn get(&self, key: &str) -> Result<DistributedItem> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        match self.items.get(key) {
            Some(entry) => {
                let (bytes, expires) = entry.value().clone();
                match expires.duration_since(SystemTime::now()) {
                    Ok(remaining) => Ok(DistributedItem::found(bytes, remaining)),
                    Err(_) => {
                        drop(entry);
                        self.items.remove(key);
                        Ok(DistributedItem::missing())
                    }
                }
            }
            None => Ok(DistributedItem::missing()),
        }
    }

    async fn set(&self, key: &str, bytes: Bytes, expiry: Duration) -> Result<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        self.items
            .insert(key.to_string(), (bytes, SystemTime::now() + expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        self.items.remove(key);
        Ok(())
    }

    async fn try_take_lock(&self, key: &str, token: &str, hold: Duration) -> Result<bool> {
        self.check_failure()?;
        let now = SystemTime::now();
        let mut taken = false;
        self.locks
            .entry(key.to_string())
            .and_modify(|(holder, expires)| {
                if *expires <= now || holder.as_str() == token {
                    *holder = token.to_string();
                    *expires = now + hold;
                    taken = true;
                }
            })
            .or_insert_with(|| {
                taken = true;
                (token.to_string(), now + hold)
            });
        Ok(taken)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<()> {
        self.locks
            .remove_if(key, |_, (holder, _)| holder.as_str() == token);
        Ok(())
    }

    async fn subscribe(&self, _patterns: &[String]) -> Result<mpsc::Receiver<String>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        *self.notify_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

pub const TEST_PREFIX: &str = "test";

/// A cache with all three tiers: memory, a tempdir-backed file tier and the
/// mock store. The tempdir guard must outlive the cache.
pub async fn build_cache(
    max_memory_bytes: u64,
) -> (LayeredCache, Arc<MockStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = MockStore::new();
    let config = CacheConfig::default()
        .with_key_prefix(TEST_PREFIX)
        .with_max_memory_bytes(max_memory_bytes)
        .with_file_directory(dir.path().to_string_lossy());
    let cache = LayeredCache::with_collaborators(
        config,
        JsonCodec,
        Some(Arc::clone(&store) as Arc<dyn Store>),
        Arc::new(SystemClock),
        Arc::new(SysDiskSpace),
    )
    .await
    .expect("cache construction");
    (cache, store, dir)
}

/// Unique key per test run so reruns never collide.
pub fn test_key(name: &str) -> String {
    format!("{}_{}", name, rand::random::<u32>())
}

/// The canonical formatted key the cache uses for `key` cached as a `T`.
/// The tag segment tracks the codec under test automatically.
pub fn formatted_key<T>(key: &str) -> String {
    layered_cache::KeyFormatter::new(TEST_PREFIX, JsonCodec.description()).format::<T>(key)
}

/// Poll until `condition` holds or `timeout_ms` elapses.
pub async fn wait_for<F, Fut>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
