//! Per-call state machines mediating between a pattern engine and the
//! transport (spec §4.4, §4.5).

pub mod client;
pub mod server;

use async_trait::async_trait;

use crate::metadata::Metadata;
use crate::stream_id::StreamId;
use crate::transport::TransportMessage;

/// What a caller-side pattern engine calls back into to drop its stream id
/// from the dispatcher's routing table once the call is done. Kept as a
/// trait (rather than importing `Dispatcher` directly into `patterns`) so
/// the pattern engines don't need to know about the dispatcher's map
/// storage, only that *something* needs telling when a call ends.
pub trait StreamUnregister: Send + Sync {
    fn unregister_client(&self, id: StreamId);
    fn unregister_server(&self, id: StreamId);
}

/// One item observed on a call's inbound sequence, at the raw-bytes level
/// (pattern engines decode `Payload` further via a `Codec<T>`).
#[derive(Debug, Clone)]
pub enum CallMessage<P> {
    Metadata(Metadata),
    Payload(P),
}

/// Which pattern engine owns a call, stamped at construction and used only
/// to pick cardinality rules — the processors themselves stay pattern-
/// agnostic (spec §3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    ClientStream,
    ServerStream,
    Bidi,
}

/// Send-side states (spec §3 data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendState {
    Idle,
    HeadersSent,
    Streaming,
    TrailerSent,
    Closed,
}

/// Receive-side mirror states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecvState {
    AwaitingHeaders,
    AwaitingPayloads,
    AwaitingTrailer,
    Closed,
}

/// Everything the dispatcher needs to route a raw transport message into a
/// live processor, independent of that processor's request/response types.
#[async_trait]
pub trait ProcessorSink: Send + Sync {
    async fn deliver(&self, message: TransportMessage);

    /// True once this processor is fully done and should be dropped from
    /// the dispatcher's lookup (spec §3: "removed on Closed").
    fn is_closed(&self) -> bool;
}
