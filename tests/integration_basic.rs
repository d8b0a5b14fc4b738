//! Basic coordinator behavior: read-your-write, tier fallback, key scoping
//! and TTL expiry across all three tiers.

mod common;

use common::*;
use layered_cache::CacheParameters;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct User {
    id: u64,
    name: String,
}

impl User {
    fn new(id: u64) -> Self {
        Self {
            id,
            name: format!("User {id}"),
        }
    }
}

#[tokio::test]
async fn read_your_write() {
    let (cache, _store, _dir) = build_cache(1 << 20).await;
    let key = test_key("rw");
    let user = User::new(1);

    cache
        .set(&key, &user, CacheParameters::with_duration(Duration::from_secs(30)))
        .await
        .expect("set");

    let cached: Option<User> = cache.get(&key).await.expect("get");
    assert_eq!(cached, Some(user));
    cache.shutdown();
}

#[tokio::test]
async fn write_reaches_every_tier() {
    let (cache, store, _dir) = build_cache(1 << 20).await;
    let key = test_key("tiers");

    cache
        .set(&key, &"value".to_string(), CacheParameters::with_duration(Duration::from_secs(30)))
        .await
        .expect("set");

    assert!(cache.contains_in_memory::<String>(&key).await);
    assert!(store.contains(&formatted_key::<String>(&key)));
    cache.shutdown();
}

#[tokio::test]
async fn expired_entry_misses_everywhere() {
    let (cache, _store, _dir) = build_cache(1 << 20).await;
    let key = test_key("ttl");

    // Under a minute, so no jitter stretches the expiry.
    cache
        .set(&key, &"1".to_string(), CacheParameters::with_duration(Duration::from_millis(300)))
        .await
        .expect("set");

    let fresh: Option<String> = cache.get(&key).await.expect("get");
    assert_eq!(fresh, Some("1".to_string()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let stale: Option<String> = cache.get(&key).await.expect("get");
    assert_eq!(stale, None);
    cache.shutdown();
}

#[tokio::test]
async fn same_user_key_different_types_never_alias() {
    let (cache, _store, _dir) = build_cache(1 << 20).await;
    let key = test_key("scoped");

    cache
        .set(&key, &"text".to_string(), CacheParameters::default())
        .await
        .expect("set string");
    cache
        .set(&key, &42u64, CacheParameters::default())
        .await
        .expect("set u64");

    let text: Option<String> = cache.get(&key).await.expect("get string");
    let number: Option<u64> = cache.get(&key).await.expect("get u64");
    assert_eq!(text, Some("text".to_string()));
    assert_eq!(number, Some(42));
    cache.shutdown();
}

#[tokio::test]
async fn oversize_entry_spills_to_disk_tier() {
    // L1 capped at 100k estimated bytes.
    let (cache, _store, _dir) = build_cache(100_000).await;
    let small = test_key("small");
    let big = test_key("big");

    cache
        .set(
            &small,
            &"v1".to_string(),
            CacheParameters::new(Duration::from_secs(30), 75_000),
        )
        .await
        .expect("set small");
    cache
        .set(
            &big,
            &"v2".to_string(),
            CacheParameters::new(Duration::from_secs(30), 175_000),
        )
        .await
        .expect("set big");

    // The oversize entry was evicted from memory but survives on disk.
    assert!(!cache.contains_in_memory::<String>(&big).await);
    let from_disk: Option<String> = cache.get(&big).await.expect("get big");
    assert_eq!(from_disk, Some("v2".to_string()));
    // `get` does not promote, so it is still not resident.
    assert!(!cache.contains_in_memory::<String>(&big).await);

    let small_value: Option<String> = cache.get(&small).await.expect("get small");
    assert_eq!(small_value, Some("v1".to_string()));
    cache.shutdown();
}

#[tokio::test]
async fn delete_removes_all_tiers() {
    let (cache, store, _dir) = build_cache(1 << 20).await;
    let key = test_key("del");

    cache
        .set(&key, &"v".to_string(), CacheParameters::default())
        .await
        .expect("set");
    cache.delete::<String>(&key).await.expect("delete");

    let gone: Option<String> = cache.get(&key).await.expect("get");
    assert_eq!(gone, None);
    assert!(!store.contains(&formatted_key::<String>(&key)));
    cache.shutdown();
}

#[tokio::test]
async fn distributed_hit_serves_reads_without_promotion() {
    let (cache, store, dir) = build_cache(1 << 20).await;
    let key = test_key("l3");

    cache
        .set(&key, &"v".to_string(), CacheParameters::with_duration(Duration::from_secs(30)))
        .await
        .expect("set");

    // Drop the local tiers; the value only survives in the store.
    let fkey = formatted_key::<String>(&key);
    cache.shutdown();
    drop(cache);
    drop(dir);
    assert!(store.contains(&fkey));

    // A fresh cache sharing the store has empty local tiers.
    let dir2 = tempfile::tempdir().expect("tempdir");
    let config = layered_cache::CacheConfig::default()
        .with_key_prefix(TEST_PREFIX)
        .with_file_directory(dir2.path().to_string_lossy());
    let cache2 = layered_cache::LayeredCache::with_collaborators(
        config,
        layered_cache::JsonCodec,
        Some(store as std::sync::Arc<dyn layered_cache::Store>),
        std::sync::Arc::new(layered_cache::SystemClock),
        std::sync::Arc::new(layered_cache::SysDiskSpace),
    )
    .await
    .expect("cache construction");

    let value: Option<String> = cache2.get(&key).await.expect("get");
    assert_eq!(value, Some("v".to_string()));
    assert!(
        !cache2.contains_in_memory::<String>(&key).await,
        "plain get must not promote into memory"
    );
    cache2.shutdown();
}
