//! Distributed cache adapter (L3).
//!
//! Wraps the [`Store`] collaborator with three concerns the coordinator
//! should not see:
//!
//! - a circuit breaker, so a failing store costs a fast error instead of a
//!   timeout per call;
//! - replica-failure self-heal: a store error mentioning "replica" triggers
//!   a reconnect, a fresh key-change subscription and a single retry;
//! - the key-change subscription itself: keyspace notifications are pumped
//!   off the store, stripped of their envelope and re-broadcast to local
//!   subscribers, with a supervisor that re-subscribes when the stream dies.

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::FLUSH_ALL_SENTINEL;
use crate::error::CacheError;
use crate::traits::{DistributedItem, Store};
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

const SUBSCRIPTION_SUPERVISOR_INTERVAL: Duration = Duration::from_secs(10);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);
const KEYSPACE_ENVELOPE_PREFIX: &str = "__keyspace@";

/// Strip the `__keyspace@<db>__:` envelope from a raw notification,
/// returning the bare key. Keys without the envelope pass through.
fn strip_keyspace_envelope(raw: &str) -> &str {
    if let Some(rest) = raw.strip_prefix(KEYSPACE_ENVELOPE_PREFIX) {
        if let Some(idx) = rest.find("__:") {
            return &rest[idx + 3..];
        }
    }
    raw
}

/// Circuit-breaker-wrapped facade over the distributed store.
pub struct DistributedCacheAdapter {
    store: Arc<dyn Store>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    patterns: Vec<String>,
    key_changed_tx: broadcast::Sender<String>,
    subscription_alive: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DistributedCacheAdapter {
    /// Create an adapter subscribing to changes for keys under `prefix` and
    /// to the flush-all sentinel.
    pub fn new(store: Arc<dyn Store>, prefix: &str, clock: Arc<dyn Clock>) -> Arc<Self> {
        let (key_changed_tx, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(1);
        let patterns = vec![
            format!("{KEYSPACE_ENVELOPE_PREFIX}*__:{prefix}*"),
            format!("{KEYSPACE_ENVELOPE_PREFIX}*__:{FLUSH_ALL_SENTINEL}*"),
        ];
        Arc::new(Self {
            store,
            breaker: CircuitBreaker::default(),
            clock,
            patterns,
            key_changed_tx,
            subscription_alive: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        })
    }

    /// Establish the key-change subscription and start the supervisor that
    /// re-establishes it if the stream handle dies.
    pub async fn start(self: &Arc<Self>) {
        if let Err(err) = self.establish_subscription().await {
            warn!(error = %err, "initial key-change subscription failed; supervisor will retry");
        }

        let adapter = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    () = adapter.clock.sleep(SUBSCRIPTION_SUPERVISOR_INTERVAL) => {}
                }
                if !adapter.subscription_alive.load(Ordering::Acquire) {
                    if let Err(err) = adapter.establish_subscription().await {
                        warn!(error = %err, "key-change re-subscription failed");
                    }
                }
            }
        });
    }

    /// Receiver of bare (envelope-stripped) changed keys.
    pub fn subscribe_key_changes(&self) -> broadcast::Receiver<String> {
        self.key_changed_tx.subscribe()
    }

    /// Stop the supervisor and the notification pump.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn establish_subscription(&self) -> anyhow::Result<()> {
        let mut rx = self.store.subscribe(&self.patterns).await?;
        self.subscription_alive.store(true, Ordering::Release);
        debug!(store = self.store.name(), "key-change subscription established");

        let key_changed_tx = self.key_changed_tx.clone();
        let alive = Arc::clone(&self.subscription_alive);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    raw = rx.recv() => match raw {
                        Some(raw) => {
                            let key = strip_keyspace_envelope(&raw).to_string();
                            // No receivers is fine; nobody is listening yet.
                            let _ = key_changed_tx.send(key);
                        }
                        None => {
                            warn!("key-change notification stream ended");
                            break;
                        }
                    }
                }
            }
            alive.store(false, Ordering::Release);
        });
        Ok(())
    }

    /// Run a store call through the breaker, self-healing replica failures
    /// with one reconnect-and-retry.
    async fn with_breaker<T, F, Fut>(&self, method: &str, op: F) -> Result<T, CacheError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.breaker.allow()?;
        match op().await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(err) if is_replica_failure(&err) => {
                warn!(method, error = %format!("{err:#}"), "replica failure, reconnecting store");
                if let Err(reconnect_err) = self.store.reconnect().await {
                    self.breaker.record_failure();
                    return Err(CacheError::store(&reconnect_err));
                }
                if let Err(sub_err) = self.establish_subscription().await {
                    warn!(error = %sub_err, "re-subscription after reconnect failed");
                }
                match op().await {
                    Ok(value) => {
                        self.breaker.record_success();
                        Ok(value)
                    }
                    Err(retry_err) => {
                        self.breaker.record_failure();
                        Err(CacheError::store(&retry_err))
                    }
                }
            }
            Err(err) => {
                self.breaker.record_failure();
                error!(method, store = self.store.name(), error = %format!("{err:#}"), "store call failed");
                Err(CacheError::store(&err))
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<DistributedItem, CacheError> {
        self.with_breaker("get", || self.store.get(key)).await
    }

    pub async fn set(&self, key: &str, bytes: Bytes, expiry: Duration) -> Result<(), CacheError> {
        self.with_breaker("set", || self.store.set(key, bytes.clone(), expiry))
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.with_breaker("delete", || self.store.delete(key)).await
    }

    /// Acquire a distributed lock, retrying every ~100 ms until `timeout`.
    /// A zero timeout makes a single attempt.
    pub async fn try_lock(
        &self,
        key: &str,
        hold: Duration,
        timeout: Duration,
    ) -> Result<DistributedLock, CacheError> {
        let token = Uuid::new_v4().to_string();
        let deadline = self.clock.now() + timeout;

        loop {
            let taken = self
                .with_breaker("try_lock", || self.store.try_take_lock(key, &token, hold))
                .await?;
            if taken {
                return Ok(DistributedLock {
                    store: Arc::clone(&self.store),
                    key: key.to_string(),
                    token,
                    released: false,
                });
            }
            if self.clock.now() >= deadline {
                return Err(CacheError::LockTimeout {
                    key: key.to_string(),
                });
            }
            self.clock.sleep(LOCK_RETRY_DELAY).await;
        }
    }
}

fn is_replica_failure(err: &anyhow::Error) -> bool {
    format!("{err:#}").to_ascii_lowercase().contains("replica")
}

/// Scoped distributed lock. [`release`](Self::release) publishes the token
/// for idempotent unlock; dropping without releasing spawns a best-effort
/// release.
pub struct DistributedLock {
    store: Arc<dyn Store>,
    key: String,
    token: String,
    released: bool,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl DistributedLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock, if still held by this token.
    pub async fn release(mut self) {
        self.released = true;
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Err(err) = self.store.release_lock(&key, &token).await {
            warn!(key, error = %format!("{err:#}"), "distributed lock release failed");
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.release_lock(&key, &token).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_stripping() {
        assert_eq!(strip_keyspace_envelope("__keyspace@0__:svc:k"), "svc:k");
        assert_eq!(strip_keyspace_envelope("__keyspace@12__:__flushall__"), "__flushall__");
        assert_eq!(strip_keyspace_envelope("svc:k"), "svc:k");
        // Keys may themselves contain colons.
        assert_eq!(strip_keyspace_envelope("__keyspace@0__:a:b:c"), "a:b:c");
    }

    #[test]
    fn replica_detection_is_case_insensitive_and_sees_context() {
        assert!(is_replica_failure(&anyhow::anyhow!("READONLY: Replica lost")));
        assert!(is_replica_failure(
            &anyhow::anyhow!("replica unavailable").context("SET failed")
        ));
        assert!(!is_replica_failure(&anyhow::anyhow!("connection refused")));
    }
}
