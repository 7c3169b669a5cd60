//! Error taxonomy for the call layer (spec §7).
//!
//! Every kind named by the taxonomy gets exactly one variant here. Nothing
//! in the core swallows an error silently except the one documented
//! exception: an unknown-stream-id message, which the dispatcher logs and
//! drops (spec §4.7, §7).

use crate::status::{Code, Status};

/// Why a [`RpcError::Protocol`] was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolErrorKind {
    #[error("frame declared a non-zero compressed flag")]
    UnsupportedCompression,
    #[error("frame length exceeds the configured cap")]
    MessageTooLarge,
    #[error("initial headers sent or received more than once for this stream")]
    DuplicateHeaders,
    #[error("payload arrived before initial headers")]
    PayloadBeforeHeaders,
    #[error("trailer arrived before initial headers")]
    TrailerBeforeHeaders,
    #[error("trailer is missing the grpc-status entry")]
    TrailerMissingStatus,
    #[error("unary call received more than one payload")]
    ExtraUnaryPayload,
}

/// The single error type observed by both callers and responders.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Send/receive against a closed or broken transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame, duplicate headers, payload-before-headers, etc.
    #[error("protocol error: {kind}")]
    Protocol { kind: ProtocolErrorKind },

    /// Codec `serialize`/`deserialize` failure.
    #[error("encoding error: {0}")]
    Encoding(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Caller-side deadline elapsed before the trailer arrived.
    #[error("call timed out")]
    Timeout,

    /// Local `close()` before natural completion.
    #[error("call was cancelled")]
    Cancelled,

    /// The peer returned a non-OK trailer.
    #[error("rpc failed: {status}")]
    Status { status: Status },

    /// The stream is already past `TrailerSent`/`Closed`.
    #[error("stream is closed")]
    ClosedStream,

    /// A server handler raised; converted to an INTERNAL trailer toward the peer.
    #[error("handler error: {0}")]
    Handler(String),

    /// A bounded per-stream inbound queue overflowed (spec §9, backpressure).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl RpcError {
    /// Classify this error as the [`Status`] that should be reported to a
    /// caller observing the response sequence terminate.
    pub fn to_status(&self) -> Status {
        match self {
            RpcError::Transport(msg) => Status::new(Code::UNAVAILABLE, msg.clone()),
            RpcError::Protocol { kind } => Status::new(Code::INTERNAL, kind.to_string()),
            RpcError::Encoding(e) => Status::new(Code::INTERNAL, e.to_string()),
            RpcError::Timeout => Status::new(Code::DEADLINE_EXCEEDED, "deadline exceeded"),
            RpcError::Cancelled => Status::new(Code::CANCELLED, "cancelled"),
            RpcError::Status { status } => status.clone(),
            RpcError::ClosedStream => Status::new(Code::INTERNAL, "stream is closed"),
            RpcError::Handler(msg) => Status::new(Code::INTERNAL, msg.clone()),
            RpcError::ResourceExhausted(msg) => Status::new(Code::RESOURCE_EXHAUSTED, msg.clone()),
        }
    }

    pub fn protocol(kind: ProtocolErrorKind) -> Self {
        RpcError::Protocol { kind }
    }

    pub fn status(status: Status) -> Self {
        RpcError::Status { status }
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        RpcError::Status { status }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_maps_to_internal() {
        let err = RpcError::protocol(ProtocolErrorKind::TrailerMissingStatus);
        assert_eq!(err.to_status().code, Code::INTERNAL);
    }

    #[test]
    fn status_error_round_trips_code() {
        let err = RpcError::status(Status::new(Code::UNIMPLEMENTED, "method not found"));
        let status = err.to_status();
        assert_eq!(status.code, Code::UNIMPLEMENTED);
        assert_eq!(status.message, "method not found");
    }

    #[test]
    fn timeout_maps_to_deadline_exceeded() {
        assert_eq!(RpcError::Timeout.to_status().code, Code::DEADLINE_EXCEEDED);
    }
}
