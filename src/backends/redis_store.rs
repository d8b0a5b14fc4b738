//! Redis store backend.
//!
//! `ConnectionManager` handles routine reconnection; `reconnect` rebuilds
//! the manager from scratch for the adapter's replica self-heal path.
//! Key-change notifications ride Redis keyspace notifications: the channel
//! name (`__keyspace@<db>__:<key>`) is forwarded verbatim and the adapter
//! strips the envelope.

use crate::config::DEFAULT_TTL;
use crate::traits::{DistributedItem, Store};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RELEASE_LOCK_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
";

/// Distributed store backed by Redis.
pub struct RedisStore {
    client: Client,
    conn: RwLock<ConnectionManager>,
}

impl RedisStore {
    /// Connect and verify the server responds.
    pub async fn connect(url: &str) -> Result<Arc<Self>> {
        let client = Client::open(url)
            .with_context(|| format!("failed to create Redis client for '{url}'"))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("failed to establish Redis connection manager")?;

        let mut probe = conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut probe)
            .await
            .context("Redis PING failed")?;

        // Keyspace notifications carry the cross-process invalidation.
        // Managed deployments may forbid CONFIG; they enable it server-side.
        let notify_config: Result<(), _> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("KEA")
            .query_async(&mut probe)
            .await;
        if let Err(err) = notify_config {
            warn!(error = %err, "could not enable keyspace notifications via CONFIG SET");
        }

        info!(url, "Redis store connected");
        Ok(Arc::new(Self {
            client,
            conn: RwLock::new(conn),
        }))
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.read().clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<DistributedItem> {
        let mut conn = self.connection();
        let bytes: Option<Vec<u8>> = conn.get(key).await.context("Redis GET failed")?;
        let Some(bytes) = bytes else {
            return Ok(DistributedItem::missing());
        };

        // PTTL: millis remaining, -1 for no expiry, -2 for just-deleted.
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("Redis PTTL failed")?;
        let expiry = if pttl > 0 {
            Duration::from_millis(pttl as u64)
        } else {
            DEFAULT_TTL
        };

        Ok(DistributedItem::found(Bytes::from(bytes), expiry))
    }

    async fn set(&self, key: &str, bytes: Bytes, expiry: Duration) -> Result<()> {
        let mut conn = self.connection();
        let millis = expiry.as_millis().max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(&bytes[..])
            .arg("PX")
            .arg(millis as u64)
            .query_async(&mut conn)
            .await
            .context("Redis SET failed")?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn.del(key).await.context("Redis DEL failed")?;
        Ok(())
    }

    async fn try_take_lock(&self, key: &str, token: &str, hold: Duration) -> Result<bool> {
        let mut conn = self.connection();
        let taken: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(hold.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .context("Redis SET NX failed")?;
        Ok(taken.is_some())
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<()> {
        let mut conn = self.connection();
        let _: i64 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .context("Redis lock release failed")?;
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to get Redis pubsub connection")?;
        for pattern in patterns {
            pubsub
                .psubscribe(pattern)
                .await
                .with_context(|| format!("failed to psubscribe to '{pattern}'"))?;
        }
        debug!(?patterns, "Redis keyspace subscription established");

        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                // For keyspace notifications the channel carries the key and
                // the payload carries the event name; the key is all we need.
                let channel = msg.get_channel_name().to_string();
                if tx.send(channel).await.is_err() {
                    break;
                }
            }
            // Receiver side treats a closed channel as a dead subscription.
        });
        Ok(rx)
    }

    async fn reconnect(&self) -> Result<()> {
        let fresh = ConnectionManager::new(self.client.clone())
            .await
            .context("failed to rebuild Redis connection manager")?;
        *self.conn.write() = fresh;
        info!("Redis store reconnected");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
