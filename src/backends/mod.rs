//! Shipped [`Store`](crate::traits::Store) implementations.
//!
//! The distributed tier is a collaborator: any client implementing `Store`
//! plugs in via [`LayeredCache::with_store`](crate::LayeredCache::with_store).
//! The crate ships a Redis implementation behind the `redis` feature.

#[cfg(feature = "redis")]
mod redis_store;

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
