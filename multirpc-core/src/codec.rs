//! The application-codec seam (spec §1: "out of scope ... specified only
//! by the interface it exposes to the core").

/// Serializes/deserializes one application message type to/from bytes.
///
/// Concrete codecs (JSON, CBOR, Protobuf, MessagePack) live in their own
/// crates and implement this trait; the core never knows which one is in
/// use.
pub trait Codec<T>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn serialize(&self, value: &T) -> Result<Vec<u8>, Self::Error>;
    fn deserialize(&self, bytes: &[u8]) -> Result<T, Self::Error>;
}
