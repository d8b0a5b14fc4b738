//! Formatted key construction.
//!
//! Every tier addresses values by the same canonical string:
//! `"<prefix>:<type-name>:<serializer-tag>:<user-key>"`. The type segment
//! keeps the same user key under different value types from aliasing; the
//! serializer tag invalidates everything when the encoder changes.

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};

/// 128-bit BLAKE2b, the digest behind on-disk file names.
type Blake2b128 = Blake2b<U16>;

/// Builds formatted keys and the derived on-disk file names.
#[derive(Debug, Clone)]
pub struct KeyFormatter {
    prefix: String,
    serializer_tag: String,
}

impl KeyFormatter {
    pub fn new(prefix: impl Into<String>, serializer_tag: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            serializer_tag: serializer_tag.into(),
        }
    }

    /// The configured prefix segment.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Canonical identity of `key` cached as a `T`.
    pub fn format<T: ?Sized>(&self, key: &str) -> String {
        format!(
            "{}:{}:{}:{key}",
            self.prefix,
            std::any::type_name::<T>(),
            self.serializer_tag
        )
    }

    /// Whether a key received on the change channel belongs to this cache.
    ///
    /// An empty prefix matches everything; shared-key deployments accept all
    /// notifications.
    pub fn owns(&self, notified_key: &str) -> bool {
        notified_key.starts_with(&self.prefix)
    }
}

/// Hex form of the 16-byte BLAKE2b digest of a formatted key, used as the
/// file name in the disk tier. 128 bits is collision-free for any realistic
/// key corpus; no secondary disambiguation is kept.
pub fn hashed_file_name(formatted_key: &str) -> String {
    let mut hasher = Blake2b128::new();
    hasher.update(formatted_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether the value type is a trait object. Cached types must be concrete:
/// a `dyn` type's name depends on the erasure site, so it cannot scope a key.
pub(crate) fn is_trait_object<T: ?Sized>() -> bool {
    let name = std::any::type_name::<T>();
    name.starts_with("dyn ") || name.contains("<dyn ") || name.contains("&dyn ")
}
