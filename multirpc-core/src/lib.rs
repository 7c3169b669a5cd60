//! Transport-agnostic RPC call-layer runtime: frame codec, metadata,
//! per-call state machines, the four gRPC-style call patterns, and the
//! dispatcher that multiplexes them over one duplex [`Transport`].
//!
//! Concrete transports and application codecs are out of scope for this
//! crate; see `multirpc-transport-memory` and `multirpc-codec-json` for
//! reference implementations of the two seams this crate exposes
//! ([`Transport`] and [`Codec`]).

pub mod call;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod logging;
pub mod metadata;
pub mod patterns;
pub mod status;
pub mod stream_id;
pub mod transport;

pub use codec::Codec;
pub use dispatcher::{Dispatcher, DispatcherOptions};
pub use error::{ProtocolErrorKind, Result, RpcError};
pub use logging::{LogLevel, LogRecord, LogSink, Logger, LoggerConfig};
pub use metadata::{Metadata, MetadataFlavor};
pub use status::{Code, Status};
pub use stream_id::{StreamId, StreamIdAllocator};
pub use transport::{MessageKind, Transport, TransportMessage};
