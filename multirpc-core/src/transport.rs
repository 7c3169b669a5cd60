//! The abstract duplex transport consumed by the core (spec §4.3).
//!
//! Concrete transports (in-memory pair, worker pipes, TCP, WebSocket) are
//! out of scope for this crate; they each implement [`Transport`] and
//! this module only describes the contract they must honor.

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::stream::BoxStream;

use crate::error::RpcError;
use crate::metadata::Metadata;
use crate::stream_id::StreamId;

/// One message unit delivered by the transport to the dispatcher.
///
/// Exactly one of `Metadata`/`Payload` is present per spec §3; that's
/// modeled directly as an enum rather than two optional fields.
#[derive(Debug, Clone)]
pub enum MessageKind {
    Metadata(Metadata),
    Payload(Bytes),
}

#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub stream_id: StreamId,
    pub kind: MessageKind,
    /// For a Metadata message: this is the trailer. Unused for Payload
    /// (the core always ends a stream with a trailer, never mid-payload).
    pub end_stream: bool,
}

impl TransportMessage {
    pub fn metadata(stream_id: StreamId, metadata: Metadata, end_stream: bool) -> Self {
        TransportMessage {
            stream_id,
            kind: MessageKind::Metadata(metadata),
            end_stream,
        }
    }

    pub fn payload(stream_id: StreamId, payload: Bytes) -> Self {
        TransportMessage {
            stream_id,
            kind: MessageKind::Payload(payload),
            end_stream: false,
        }
    }
}

/// The duplex byte channel the core multiplexes calls over.
///
/// Implementations MUST preserve per-`stream_id` ordering of everything
/// sent via `send_message`/`send_metadata`, and MAY interleave distinct
/// streams freely (spec §4.3, §5).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget a framed application message on the wire.
    async fn send_message(&self, stream_id: StreamId, frame: Bytes) -> Result<(), RpcError>;

    /// Send a metadata frame, ordered relative to `send_message` on the
    /// same `stream_id`.
    async fn send_metadata(
        &self,
        stream_id: StreamId,
        metadata: Metadata,
        end_stream: bool,
    ) -> Result<(), RpcError>;

    /// Take ownership of the single-consumer inbound sequence. Must be
    /// called exactly once per transport instance; implementations should
    /// return `None` on a second call.
    fn take_incoming(&self) -> Option<BoxStream<'static, TransportMessage>>;

    /// Tear down the transport. After this, sends fail with
    /// `RpcError::Transport` and the incoming sequence terminates.
    async fn close(&self) -> Result<(), RpcError>;
}
