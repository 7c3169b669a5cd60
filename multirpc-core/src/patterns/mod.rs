//! The four call patterns (spec §4.6), each a thin cardinality/completion
//! wrapper over a [`crate::call::client::CallProcessor`] or
//! [`crate::call::server::StreamProcessor`].
//!
//! Grounded on the teacher's `invoke_unary`/`invoke_server_stream`/
//! `invoke_client_stream`/`invoke_bidi_stream` quartet, which dispatches on
//! the same two-axis (client-streaming?, server-streaming?) shape as
//! `CallKind` here — minus tonic, minus dynamic protobuf.

pub mod bidi;
pub mod client_stream;
pub mod server_stream;
pub mod unary;

use std::time::Duration;

use crate::codec::Codec;
use crate::error::RpcError;

/// Encode one value through a [`Codec`], wrapping its error uniformly.
pub(crate) fn encode<T, C: Codec<T>>(codec: &C, value: &T) -> Result<Vec<u8>, RpcError> {
    codec.serialize(value).map_err(|e| RpcError::Encoding(Box::new(e)))
}

/// Decode one value through a [`Codec`], wrapping its error uniformly.
pub(crate) fn decode<T, C: Codec<T>>(codec: &C, bytes: &[u8]) -> Result<T, RpcError> {
    codec.deserialize(bytes).map_err(|e| RpcError::Encoding(Box::new(e)))
}

/// Shared caller-side timeout wrapper: race `fut` against `timeout`,
/// mapping elapsed time to `RpcError::Timeout` (spec §4.6, §4.8).
pub(crate) async fn with_timeout<T>(
    timeout: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T, RpcError>>,
) -> Result<T, RpcError> {
    match timeout {
        Some(dur) => match tokio::time::timeout(dur, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(RpcError::Timeout),
        },
        None => fut.await,
    }
}
