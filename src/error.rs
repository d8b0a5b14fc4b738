//! Error model for the layered cache.
//!
//! The facade degrades rather than fails: most tier errors are logged and
//! reported as misses. The variants here are the errors that do surface to
//! callers, or that the coordinator needs to distinguish internally.

use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the layered cache.
///
/// `Clone` is required so a single failure inside a collapsed load can be
/// handed to every waiter of the same key.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The cached type must be concrete; trait objects have no stable
    /// identity to scope a key by.
    #[error("cache type '{type_name}' is a trait object; cache a concrete type")]
    InterfaceType { type_name: &'static str },

    /// Serialization of a value failed during a write.
    #[error("failed to serialize value for key '{key}': {reason}")]
    SerializeFailed { key: String, reason: String },

    /// Deserialization of cached bytes failed during a read.
    #[error("failed to deserialize value for key '{key}': {reason}")]
    DeserializeFailed { key: String, reason: String },

    /// An on-disk record had an unreadable or inconsistent header. The file
    /// is deleted before this is reported; callers observe a miss.
    #[error("corrupt cache file '{path}'")]
    CorruptFile { path: String },

    /// The circuit breaker around the distributed store is open.
    #[error("distributed store circuit breaker is open")]
    BreakerOpen,

    /// A distributed lock could not be taken within the caller's timeout.
    #[error("timed out acquiring distributed lock '{key}'")]
    LockTimeout { key: String },

    /// The distributed store collaborator reported a failure.
    #[error("distributed store error: {0}")]
    Store(String),

    /// The caller's factory returned an error from `get_or_create`.
    #[error("{0}")]
    Factory(Arc<anyhow::Error>),
}

impl CacheError {
    pub(crate) fn store(err: &anyhow::Error) -> Self {
        Self::Store(format!("{err:#}"))
    }

    pub(crate) fn factory(err: anyhow::Error) -> Self {
        Self::Factory(Arc::new(err))
    }
}

/// Crate-wide result alias.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_error_is_cloneable_and_displays_cause() {
        let err = CacheError::factory(anyhow::anyhow!("backend exploded"));
        let cloned = err.clone();
        assert_eq!(err.to_string(), "backend exploded");
        assert_eq!(cloned.to_string(), "backend exploded");
    }

    #[test]
    fn store_error_keeps_context_chain() {
        let source = anyhow::anyhow!("connection refused").context("GET failed");
        let err = CacheError::store(&source);
        let text = err.to_string();
        assert!(text.contains("GET failed"));
        assert!(text.contains("connection refused"));
    }
}
