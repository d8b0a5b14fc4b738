//! Cross-process invalidation via key-change notifications.

mod common;

use common::*;
use layered_cache::CacheParameters;
use std::time::Duration;

#[tokio::test]
async fn prefix_matching_notification_removes_local_copies() {
    let (cache, store, _dir) = build_cache(1 << 20).await;
    let key = test_key("inval");

    cache
        .set(&key, &"v".to_string(), CacheParameters::with_duration(Duration::from_secs(300)))
        .await
        .expect("set");
    assert!(cache.contains_in_memory::<String>(&key).await);

    // Another process changed the key; its store publishes the change.
    let fkey = formatted_key::<String>(&key);
    store.publish(&format!("__keyspace@0__:{fkey}")).await;

    let removed = wait_for(
        || async { !cache.contains_in_memory::<String>(&key).await },
        2000,
    )
    .await;
    assert!(removed, "notification should evict the memory copy");

    // The disk copy goes too; with the store copy dropped, reads miss
    // everywhere. The disk removal trails the memory one, so poll.
    store.items_remove(&fkey);
    let fully_gone = wait_for(
        || async {
            let after: Option<String> = cache.get(&key).await.unwrap_or(None);
            after.is_none()
        },
        2000,
    )
    .await;
    assert!(fully_gone, "local tiers should not resurrect the key");
    cache.shutdown();
}

#[tokio::test]
async fn foreign_prefix_notifications_are_ignored() {
    let (cache, store, _dir) = build_cache(1 << 20).await;
    let key = test_key("foreign");

    cache
        .set(&key, &"v".to_string(), CacheParameters::with_duration(Duration::from_secs(300)))
        .await
        .expect("set");

    store
        .publish("__keyspace@0__:other-service:alloc::string::String:json:x")
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        cache.contains_in_memory::<String>(&key).await,
        "a foreign key change must not touch our entries"
    );
    cache.shutdown();
}

#[tokio::test]
async fn flush_all_purges_memory_and_disk() {
    let (cache, store, _dir) = build_cache(1 << 20).await;
    let key_a = test_key("flush_a");
    let key_b = test_key("flush_b");

    for key in [&key_a, &key_b] {
        cache
            .set(key, &"v".to_string(), CacheParameters::with_duration(Duration::from_secs(300)))
            .await
            .expect("set");
    }

    store.publish("__keyspace@0__:__flushall__marker").await;

    let purged = wait_for(
        || async {
            !cache.contains_in_memory::<String>(&key_a).await
                && !cache.contains_in_memory::<String>(&key_b).await
        },
        2000,
    )
    .await;
    assert!(purged, "flush-all should compact the memory tier");

    // The disk tier clear runs in the background; wait for it too. Remove
    // the store copies so reads cannot fall through to L3.
    store.items_remove(&formatted_key::<String>(&key_a));
    store.items_remove(&formatted_key::<String>(&key_b));
    let disk_empty = wait_for(
        || async {
            let a: Option<String> = cache.get(&key_a).await.unwrap_or(None);
            let b: Option<String> = cache.get(&key_b).await.unwrap_or(None);
            a.is_none() && b.is_none()
        },
        3000,
    )
    .await;
    assert!(disk_empty, "flush-all should clear the disk tier");
    cache.shutdown();
}
