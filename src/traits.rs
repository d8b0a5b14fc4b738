//! Collaborator contracts.
//!
//! Two seams keep the facade independent of concrete encoders and stores:
//!
//! - [`Serializer`]: pluggable value encoding, chosen at the type level
//!   (`LayeredCache<C>`) so call sites stay monomorphic.
//! - [`Store`]: the distributed tier. Object-safe so deployments can hand in
//!   any client; the crate ships a Redis implementation behind the `redis`
//!   feature.
//!
//! Store implementations report failures as `anyhow::Error`; the facade maps
//! them into [`CacheError`](crate::CacheError) at the adapter boundary.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;

/// Pluggable value serializer.
///
/// The `description` tag is embedded into every formatted key, so switching
/// encoders re-keys the whole cache instead of feeding old bytes to a new
/// decoder.
pub trait Serializer: Send + Sync + Debug {
    /// Serialize a value to bytes.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Short tag identifying this encoding (e.g. `"json"`).
    fn description(&self) -> &'static str;
}

/// A value read from the distributed store.
///
/// `bytes` and `expiry` are both present or both absent: a stored value
/// always carries its remaining TTL.
#[derive(Debug, Clone, Default)]
pub struct DistributedItem {
    pub bytes: Option<Bytes>,
    pub expiry: Option<Duration>,
}

impl DistributedItem {
    /// A present value with its remaining TTL.
    #[must_use]
    pub fn found(bytes: Bytes, expiry: Duration) -> Self {
        Self {
            bytes: Some(bytes),
            expiry: Some(expiry),
        }
    }

    /// The miss marker.
    #[must_use]
    pub fn missing() -> Self {
        Self::default()
    }

    /// Whether the read produced a value.
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.bytes.is_some() && self.expiry.is_some()
    }
}

/// The distributed store collaborator: GET/SET/DELETE, advisory locks and a
/// key-change notification stream.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a key. A miss is `DistributedItem::missing()`, not an error.
    async fn get(&self, key: &str) -> Result<DistributedItem>;

    /// Write a key with a TTL.
    async fn set(&self, key: &str, bytes: Bytes, expiry: Duration) -> Result<()>;

    /// Delete a key. Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Attempt a single atomic lock take. Returns `false` when another
    /// holder owns the lock.
    async fn try_take_lock(&self, key: &str, token: &str, hold: Duration) -> Result<bool>;

    /// Release a lock if `token` still owns it. Idempotent.
    async fn release_lock(&self, key: &str, token: &str) -> Result<()>;

    /// Subscribe to key-change notifications matching `patterns`. Raw
    /// notification keys (still wearing the store's envelope) arrive on the
    /// returned channel; the channel closing signals a dead subscription.
    async fn subscribe(&self, patterns: &[String]) -> Result<mpsc::Receiver<String>>;

    /// Rebuild the connection after a replica failure.
    async fn reconnect(&self) -> Result<()>;

    /// Name for logging.
    fn name(&self) -> &'static str {
        "store"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distributed_item_value_invariant() {
        assert!(!DistributedItem::missing().has_value());
        let item = DistributedItem::found(Bytes::from_static(b"v"), Duration::from_secs(1));
        assert!(item.has_value());
    }
}
