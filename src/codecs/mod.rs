//! Built-in implementations of the [`Serializer`](crate::traits::Serializer)
//! contract.

mod json;
pub use json::JsonCodec;
