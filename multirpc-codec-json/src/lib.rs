//! A `serde_json`-backed [`Codec`] for any `Serialize + DeserializeOwned`
//! application message type.

use std::marker::PhantomData;

use multirpc_core::Codec;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum JsonCodecError {
    #[error("json serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("json deserialize failed: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Encodes each application message as a standalone JSON document.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec { _marker: PhantomData }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        JsonCodec::new()
    }
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Codec<T> for JsonCodec<T> {
    type Error = JsonCodecError;

    fn serialize(&self, value: &T) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(value).map_err(JsonCodecError::Serialize)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(bytes).map_err(JsonCodecError::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Greeting {
        text: String,
    }

    #[test]
    fn round_trips_through_json() {
        let codec: JsonCodec<Greeting> = JsonCodec::new();
        let original = Greeting { text: "hello".to_string() };
        let bytes = codec.serialize(&original).unwrap();
        let decoded = codec.deserialize(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn malformed_json_is_a_deserialize_error() {
        let codec: JsonCodec<Greeting> = JsonCodec::new();
        let err = codec.deserialize(b"not json").unwrap_err();
        assert!(matches!(err, JsonCodecError::Deserialize(_)));
    }
}
