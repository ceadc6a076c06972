//! Conversion between domain payload types and the JSON values stored in the
//! log.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A [`Codec`] converts a payload type to and from the JSON value stored
/// alongside events.
///
/// Implementations must round-trip: `decode(encode(value)) == value`.
pub trait Codec<T>: Send + Sync {
    /// The error returned by [`Codec::decode`].
    type Error: Send + Sync;

    /// Encodes the given value into its stored JSON representation.
    fn encode(&self, value: T) -> Value;

    /// Decodes a value from its stored JSON representation.
    fn decode(&self, value: Value) -> Result<T, Self::Error>;
}

/// [`Codec`] implementation using the [serde] data model.
#[derive(Debug, Clone, Copy)]
pub struct Json<T>(PhantomData<T>)
where
    T: Serialize + DeserializeOwned + Send + Sync;

impl<T> Default for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Codec<T> for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    type Error = serde_json::Error;

    fn encode(&self, value: T) -> Value {
        serde_json::to_value(value).expect("json serialization should not fail")
    }

    fn decode(&self, value: Value) -> Result<T, Self::Error> {
        serde_json::from_value(value)
    }
}
