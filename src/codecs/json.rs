//! JSON serializer using `serde_json`.

use crate::traits::Serializer;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Default serializer: plain `serde_json`.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl Serializer for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn description(&self) -> &'static str {
        "json"
    }
}
