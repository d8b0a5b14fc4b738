//! Layered cache coordinator.
//!
//! The public facade over the three tiers. Reads walk memory → disk →
//! distributed; writes go through to every tier; loads collapse to a single
//! factory execution per key. Key-change notifications from the distributed
//! store remove local copies so peers converge.
//!
//! Tier failures follow a two-level discipline: the disk tier and the
//! distributed GET/SET paths degrade to misses with a log line, while
//! distributed DELETE, factory failures and serializer failures surface.
//! Hiding a failed delete would let read-through resurrect the value.

use crate::clock::{Clock, SystemClock};
use crate::codecs::JsonCodec;
use crate::config::{CacheConfig, CacheParameters, DEFAULT_TTL, FLUSH_ALL_SENTINEL};
use crate::disk_space::{DiskSpace, SysDiskSpace};
use crate::distributed::{DistributedCacheAdapter, DistributedLock};
use crate::error::CacheError;
use crate::file_cache::{FileCache, FilePayload};
use crate::jitter::jitter_ttl;
use crate::key::{is_trait_object, KeyFormatter};
use crate::memory_tier::MemoryTier;
use crate::single_flight::{FlightOutput, SingleFlight};
use crate::traits::{Serializer, Store};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Context handed to a `get_or_create` factory.
///
/// The factory may adjust the entry's cache parameters before returning; the
/// write-through uses whatever the context holds once the factory settles.
pub struct CreateContext {
    key: String,
    state: Option<Arc<dyn Any + Send + Sync>>,
    cancel: CancellationToken,
    params: parking_lot::Mutex<CacheParameters>,
}

impl CreateContext {
    fn new(key: String, state: Option<Arc<dyn Any + Send + Sync>>) -> Arc<Self> {
        Arc::new(Self {
            key,
            state,
            cancel: CancellationToken::new(),
            params: parking_lot::Mutex::new(CacheParameters::default()),
        })
    }

    /// The formatted key being loaded.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opaque caller state, downcast to its concrete type.
    pub fn state<S: Send + Sync + 'static>(&self) -> Option<Arc<S>> {
        self.state.clone().and_then(|s| s.downcast::<S>().ok())
    }

    /// Cancelled when every collapsed waiter has given up on this load.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current cache parameters for the pending write-through.
    pub fn params(&self) -> CacheParameters {
        *self.params.lock()
    }

    /// Set the entry's TTL. Zero is coerced to the default.
    pub fn set_duration(&self, duration: Duration) {
        let mut params = self.params.lock();
        *params = CacheParameters::new(duration, params.size);
    }

    /// Set the entry's memory-tier size estimate.
    pub fn set_size(&self, size: u32) {
        self.params.lock().size = size;
    }
}

struct CacheInner<C: Serializer> {
    formatter: KeyFormatter,
    codec: C,
    clock: Arc<dyn Clock>,
    memory: MemoryTier,
    file: Option<Arc<FileCache>>,
    distributed: Option<Arc<DistributedCacheAdapter>>,
    flights: SingleFlight,
    shutdown_tx: broadcast::Sender<()>,
}

/// Three-tier cache facade. Cheap to clone; clones share all tiers.
pub struct LayeredCache<C: Serializer = JsonCodec> {
    inner: Arc<CacheInner<C>>,
}

impl<C: Serializer> Clone for LayeredCache<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl LayeredCache<JsonCodec> {
    /// Build a cache from configuration with the default JSON serializer.
    pub async fn new(config: CacheConfig) -> anyhow::Result<Self> {
        Self::with_serializer(config, JsonCodec).await
    }
}

impl<C: Serializer + 'static> LayeredCache<C> {
    /// Build a cache with a custom serializer.
    pub async fn with_serializer(config: CacheConfig, codec: C) -> anyhow::Result<Self> {
        let store = Self::connect_store(&config).await?;
        Self::with_collaborators(
            config,
            codec,
            store,
            Arc::new(SystemClock),
            Arc::new(SysDiskSpace),
        )
        .await
    }

    /// Build a cache around an externally constructed store.
    pub async fn with_store(
        config: CacheConfig,
        codec: C,
        store: Arc<dyn Store>,
    ) -> anyhow::Result<Self> {
        Self::with_collaborators(
            config,
            codec,
            Some(store),
            Arc::new(SystemClock),
            Arc::new(SysDiskSpace),
        )
        .await
    }

    /// Full capability injection: store, clock and disk probe. Tests use
    /// this to drive time and disk pressure deterministically.
    pub async fn with_collaborators(
        config: CacheConfig,
        codec: C,
        store: Option<Arc<dyn Store>>,
        clock: Arc<dyn Clock>,
        disk: Arc<dyn DiskSpace>,
    ) -> anyhow::Result<Self> {
        // The key tag is the injected codec's own description; swapping
        // encoders re-keys the cache.
        let formatter = KeyFormatter::new(config.key_prefix.clone(), codec.description());
        let memory = MemoryTier::new(config.max_memory_bytes, Arc::clone(&clock));

        let file = if config.file_directory.is_empty() {
            None
        } else {
            let app_segment = if config.key_prefix.is_empty() {
                "shared"
            } else {
                &config.key_prefix
            };
            let file = FileCache::new(
                &config.file_directory,
                app_segment,
                config.file_free_space_threshold_pct,
                Arc::clone(&clock),
                disk,
            )?;
            file.start_reclaim();
            Some(file)
        };

        let distributed = match store {
            Some(store) => {
                let adapter =
                    DistributedCacheAdapter::new(store, &config.key_prefix, Arc::clone(&clock));
                adapter.start().await;
                Some(adapter)
            }
            None => None,
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        let inner = Arc::new(CacheInner {
            formatter,
            codec,
            clock,
            memory,
            file,
            distributed,
            flights: SingleFlight::new(),
            shutdown_tx,
        });
        Self::start_invalidation_pump(&inner);

        Ok(Self { inner })
    }

    #[cfg(feature = "redis")]
    async fn connect_store(config: &CacheConfig) -> anyhow::Result<Option<Arc<dyn Store>>> {
        if config.distributed_endpoint.is_empty() {
            return Ok(None);
        }
        let store: Arc<dyn Store> =
            crate::backends::RedisStore::connect(&config.distributed_endpoint).await?;
        Ok(Some(store))
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_store(config: &CacheConfig) -> anyhow::Result<Option<Arc<dyn Store>>> {
        if config.distributed_endpoint.is_empty() {
            return Ok(None);
        }
        anyhow::bail!(
            "a distributed endpoint is configured but the 'redis' feature is disabled; \
             use with_store to supply a store"
        )
    }

    /// Consume key-change notifications and remove local copies. Heavy work
    /// (a full disk clear) is pushed onto its own task so the pump never
    /// falls behind the notification stream.
    fn start_invalidation_pump(inner: &Arc<CacheInner<C>>) {
        let Some(adapter) = &inner.distributed else {
            return;
        };
        let mut changes = adapter.subscribe_key_changes();
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    changed = changes.recv() => match changed {
                        Ok(key) => Self::handle_key_changed(&inner, &key).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "invalidation pump lagged behind notifications");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    async fn handle_key_changed(inner: &Arc<CacheInner<C>>, key: &str) {
        if key.contains(FLUSH_ALL_SENTINEL) {
            debug!("flush-all notification received, purging local tiers");
            inner.memory.clear_all().await;
            if let Some(file) = &inner.file {
                let file = Arc::clone(file);
                tokio::spawn(async move {
                    file.clear().await;
                });
            }
        } else if inner.formatter.owns(key) {
            debug!(key, "key-change notification, removing local copies");
            inner.memory.remove(key).await;
            if let Some(file) = &inner.file {
                file.remove(key).await;
            }
        }
    }

    fn decode<T: DeserializeOwned>(inner: &CacheInner<C>, key: &str, bytes: &[u8]) -> Result<T, CacheError> {
        inner.codec.deserialize(bytes).map_err(|err| CacheError::DeserializeFailed {
            key: key.to_string(),
            reason: format!("{err:#}"),
        })
    }

    /// Read a key, walking the tiers in order. Hits are returned from the
    /// first tier that has the value; upper tiers are not populated. Only
    /// `set` and `get_or_create` promote.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let inner = &self.inner;
        let fkey = inner.formatter.format::<T>(key);

        if let Some(bytes) = inner.memory.get(&fkey).await {
            return Self::decode(inner, &fkey, &bytes).map(Some);
        }

        if let Some(file) = &inner.file {
            if let Some(item) = file.get_value::<T, C>(&fkey, &inner.codec).await {
                return Ok(Some(item.value));
            }
        }

        if let Some(adapter) = &inner.distributed {
            match adapter.get(&fkey).await {
                Ok(item) if item.has_value() => {
                    let bytes = item.bytes.unwrap_or_default();
                    return Self::decode(inner, &fkey, &bytes).map(Some);
                }
                Ok(_) => {}
                Err(err) => {
                    // The distributed tier being down is a miss, not a failure.
                    error!(method = "get", key = %fkey, error = %err, "distributed read failed");
                }
            }
        }

        Ok(None)
    }

    /// Write a key through every tier. Completes once the memory and disk
    /// tiers have acknowledged; distributed failures are logged and
    /// swallowed.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        params: CacheParameters,
    ) -> Result<(), CacheError> {
        let inner = &self.inner;
        let fkey = inner.formatter.format::<T>(key);
        let params = CacheParameters::new(params.duration, params.size);

        let encoded = inner.codec.serialize(value).map_err(|err| CacheError::SerializeFailed {
            key: fkey.clone(),
            reason: format!("{err:#}"),
        })?;
        let bytes = Bytes::from(encoded);

        // One jitter draw shared by all tiers keeps absolute expiries
        // ordered L1 <= L2 <= L3.
        let ttl = jitter_ttl(&mut rand::thread_rng(), params.duration);

        inner.memory.set(&fkey, bytes.clone(), ttl, params.size).await;
        if let Some(file) = &inner.file {
            file.set::<[u8], C>(&fkey, FilePayload::Raw(&bytes), ttl, &inner.codec)
                .await;
        }
        if let Some(adapter) = &inner.distributed {
            if let Err(err) = adapter.set(&fkey, bytes, ttl).await {
                error!(method = "set", key = %fkey, error = %err, "distributed write failed");
            }
        }
        Ok(())
    }

    /// Remove a key from every tier. Distributed deletion failures
    /// propagate: a hidden failed delete would resurrect the value through
    /// read-through on another instance.
    pub async fn delete<T>(&self, key: &str) -> Result<(), CacheError> {
        let inner = &self.inner;
        let fkey = inner.formatter.format::<T>(key);

        inner.memory.remove(&fkey).await;
        if let Some(file) = &inner.file {
            file.remove(&fkey).await;
        }
        if let Some(adapter) = &inner.distributed {
            adapter.delete(&fkey).await?;
        }
        Ok(())
    }

    /// Read a key, or build it with `factory`: at most one concurrent
    /// factory execution per key, all waiters observing the same outcome.
    ///
    /// A factory returning `Ok(None)` is passed through without caching; a
    /// failing factory purges the key from every tier and the error reaches
    /// every collapsed waiter.
    pub async fn get_or_create<T, F, Fut>(&self, key: &str, factory: F) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(Arc<CreateContext>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        self.get_or_create_with_state(key, None, factory).await
    }

    /// [`get_or_create`](Self::get_or_create) with opaque state made
    /// available to the factory through the context.
    pub async fn get_or_create_with_state<T, F, Fut>(
        &self,
        key: &str,
        state: Option<Arc<dyn Any + Send + Sync>>,
        factory: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(Arc<CreateContext>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        if is_trait_object::<T>() {
            return Err(CacheError::InterfaceType {
                type_name: std::any::type_name::<T>(),
            });
        }

        let inner = &self.inner;
        let fkey = inner.formatter.format::<T>(key);

        // Fast path: a resident value never enters the collapser.
        if let Some(bytes) = inner.memory.get(&fkey).await {
            return Self::decode(inner, &fkey, &bytes).map(Some);
        }

        let ctx = CreateContext::new(fkey.clone(), state);
        let flight_inner = Arc::clone(inner);
        let flight_ctx = Arc::clone(&ctx);
        let output = inner
            .flights
            .run(&fkey, move || Self::load_or_create(flight_inner, flight_ctx, factory))
            .await;

        match output {
            Ok(Some(bytes)) => Self::decode(inner, &fkey, &bytes).map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The collapsed load: check the lower tiers, then run the factory and
    /// write through. Returns the serialized value; each waiter decodes its
    /// own copy.
    async fn load_or_create<T, F, Fut>(
        inner: Arc<CacheInner<C>>,
        ctx: Arc<CreateContext>,
        factory: F,
    ) -> FlightOutput
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(Arc<CreateContext>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        // If every waiter is cancelled this future is dropped and the guard
        // cancels the context, aborting whatever the factory started.
        let _cancel_guard = ctx.cancellation().clone().drop_guard();
        let fkey = ctx.key().to_string();

        // Another flight may have completed between the caller's fast path
        // and this one starting.
        if let Some(bytes) = inner.memory.get(&fkey).await {
            return Ok(Some(bytes));
        }

        if let Some(file) = &inner.file {
            if let Some(item) = file.get_bytes(&fkey).await {
                let remaining = item
                    .expires
                    .duration_since(inner.clock.now())
                    .unwrap_or(Duration::ZERO);
                // Doubled: the in-memory copy pays for both the bytes and
                // the materialised value once deserialized.
                ctx.set_size(item.size.saturating_mul(2));
                ctx.set_duration(remaining);
                let params = ctx.params();
                inner
                    .memory
                    .set(&fkey, item.value.clone(), params.duration, params.size)
                    .await;
                return Ok(Some(item.value));
            }
        }

        if let Some(adapter) = &inner.distributed {
            match adapter.get(&fkey).await {
                Ok(item) if item.has_value() => {
                    let bytes = item.bytes.clone().unwrap_or_default();
                    // Validate the payload decodes before promoting it.
                    match inner.codec.deserialize::<T>(&bytes) {
                        Ok(_) => {
                            let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
                            ctx.set_size(len.saturating_mul(2));
                            ctx.set_duration(item.expiry.unwrap_or(DEFAULT_TTL));
                            let params = ctx.params();
                            inner
                                .memory
                                .set(&fkey, bytes.clone(), params.duration, params.size)
                                .await;
                            return Ok(Some(bytes));
                        }
                        Err(err) => {
                            warn!(key = %fkey, error = %format!("{err:#}"), "undecodable distributed value, rebuilding");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    error!(method = "get_or_create", key = %fkey, error = %err, "distributed read failed");
                }
            }
        }

        let produced = match factory(Arc::clone(&ctx)).await {
            Ok(value) => value,
            Err(err) => {
                // Never leave a half-written key behind a failed factory.
                Self::purge_all_tiers(&inner, &fkey).await;
                return Err(CacheError::factory(err));
            }
        };

        let Some(value) = produced else {
            return Ok(None);
        };

        let bytes = match inner.codec.serialize(&value) {
            Ok(encoded) => Bytes::from(encoded),
            Err(err) => {
                Self::purge_all_tiers(&inner, &fkey).await;
                return Err(CacheError::SerializeFailed {
                    key: fkey,
                    reason: format!("{err:#}"),
                });
            }
        };

        let params = ctx.params();
        let ttl = jitter_ttl(&mut rand::thread_rng(), params.duration);

        inner.memory.set(&fkey, bytes.clone(), ttl, params.size).await;
        if let Some(file) = &inner.file {
            file.set::<[u8], C>(&fkey, FilePayload::Raw(&bytes), ttl, &inner.codec)
                .await;
        }
        if let Some(adapter) = &inner.distributed {
            if let Err(err) = adapter.set(&fkey, bytes.clone(), ttl).await {
                error!(method = "get_or_create", key = %fkey, error = %err, "distributed write failed");
            }
        }

        Ok(Some(bytes))
    }

    async fn purge_all_tiers(inner: &CacheInner<C>, fkey: &str) {
        inner.memory.remove(fkey).await;
        if let Some(file) = &inner.file {
            file.remove(fkey).await;
        }
        if let Some(adapter) = &inner.distributed {
            if let Err(err) = adapter.delete(fkey).await {
                warn!(key = %fkey, error = %err, "best-effort purge of distributed tier failed");
            }
        }
    }

    /// Acquire a distributed advisory lock. `timeout` of zero makes a
    /// single attempt.
    pub async fn try_acquire_lock(
        &self,
        key: &str,
        hold: Duration,
        timeout: Duration,
    ) -> Result<DistributedLock, CacheError> {
        match &self.inner.distributed {
            Some(adapter) => adapter.try_lock(key, hold, timeout).await,
            None => Err(CacheError::Store(
                "no distributed store configured".to_string(),
            )),
        }
    }

    /// Whether the memory tier currently holds `key` cached as a `T`.
    /// Observes residency without promoting or touching hit counters.
    pub async fn contains_in_memory<T>(&self, key: &str) -> bool {
        let fkey = self.inner.formatter.format::<T>(key);
        self.inner.memory.contains(&fkey).await
    }

    /// Snapshot of cache activity.
    pub fn stats(&self) -> LayeredCacheStats {
        let (memory_hits, memory_misses) = self.inner.memory.stats();
        LayeredCacheStats {
            memory_hits,
            memory_misses,
            in_flight_loads: self.inner.flights.len(),
        }
    }

    /// Stop the invalidation pump, the disk reclaim loop and the
    /// subscription supervisor. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
        if let Some(file) = &self.inner.file {
            file.shutdown();
        }
        if let Some(adapter) = &self.inner.distributed {
            adapter.shutdown();
        }
    }
}

/// Activity counters for a [`LayeredCache`].
#[derive(Debug, Clone)]
pub struct LayeredCacheStats {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub in_flight_loads: usize,
}
