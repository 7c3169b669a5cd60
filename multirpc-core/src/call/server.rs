//! The server-side call processor (spec §4.5).
//!
//! A `StreamProcessor` is created lazily by the dispatcher the first time a
//! client's InitialRequest Metadata arrives on a stream id it hasn't seen
//! (spec §9's resolution of the lazy-vs-eager Open Question). The initial
//! Metadata itself is handed to [`StreamProcessor::deliver`] like any other
//! inbound message, exactly as the client-side `CallProcessor` would.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::call::{CallMessage, ProcessorSink, RecvState, SendState, StreamUnregister};
use crate::error::{ProtocolErrorKind, RpcError};
use crate::frame::{encode_frame, FrameParser};
use crate::logging::Logger;
use crate::metadata::{Metadata, MetadataFlavor};
use crate::status::{Code, Status};
use crate::stream_id::StreamId;
use crate::transport::{MessageKind, Transport, TransportMessage};

use super::client::DEFAULT_QUEUE_DEPTH;

fn send_to_recv(n: u8) -> RecvState {
    match n {
        0 => RecvState::AwaitingHeaders,
        1 => RecvState::AwaitingPayloads,
        2 => RecvState::AwaitingTrailer,
        _ => RecvState::Closed,
    }
}

/// Per-call server-side state machine.
///
/// Owned by the pattern engine (Responder) the dispatcher constructs for a
/// matched path, shared with the dispatcher only as a `ProcessorSink`.
pub struct StreamProcessor {
    transport: Arc<dyn Transport>,
    stream_id: StreamId,
    logger: Logger,

    send_state: Mutex<SendState>,
    recv_state: AtomicU8,
    parser: Mutex<FrameParser>,
    closed: AtomicBool,

    /// Requests observed from the client, decoded to raw frame bytes.
    outbound: mpsc::Sender<Result<CallMessage<Bytes>, RpcError>>,

    /// Drops this stream id from the dispatcher's routing table once the
    /// Trailer actually goes out, since no further inbound message is
    /// guaranteed to arrive afterward to trigger cleanup the way the
    /// client side's post-`deliver` check does.
    cleanup: Option<(Arc<dyn StreamUnregister>, StreamId)>,
}

impl StreamProcessor {
    /// Construct a processor bound to an already-allocated `stream_id`
    /// (reused from the client's InitialRequest, never freshly allocated
    /// server-side — spec §9).
    pub fn new(
        transport: Arc<dyn Transport>,
        stream_id: StreamId,
        logger: Logger,
        cleanup: Option<(Arc<dyn StreamUnregister>, StreamId)>,
    ) -> (Arc<Self>, mpsc::Receiver<Result<CallMessage<Bytes>, RpcError>>) {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_DEPTH);
        let processor = Arc::new(StreamProcessor {
            transport,
            stream_id,
            logger,
            send_state: Mutex::new(SendState::Idle),
            recv_state: AtomicU8::new(0),
            parser: Mutex::new(FrameParser::new()),
            closed: AtomicBool::new(false),
            outbound: tx,
            cleanup,
        });
        (processor, rx)
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Send the InitialResponse metadata. Idempotent only in the sense
    /// that a second call is a programming error surfaced as
    /// `ClosedStream`; pattern engines call this exactly once.
    pub async fn send_initial_response(&self) -> Result<(), RpcError> {
        let mut state = self.send_state.lock().unwrap();
        if *state != SendState::Idle {
            return Err(RpcError::ClosedStream);
        }
        *state = SendState::HeadersSent;
        drop(state);
        self.transport
            .send_metadata(self.stream_id, Metadata::for_server_initial_response(), false)
            .await
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), RpcError> {
        {
            let mut state = self.send_state.lock().unwrap();
            if *state == SendState::Idle {
                return Err(RpcError::protocol(ProtocolErrorKind::PayloadBeforeHeaders));
            }
            if *state >= SendState::TrailerSent {
                return Err(RpcError::ClosedStream);
            }
            *state = SendState::Streaming;
        }
        let frame = encode_frame(payload);
        self.transport.send_message(self.stream_id, frame).await
    }

    /// Send the call's single terminal Trailer. Exactly one is sent per
    /// stream (spec invariant 2); a second call is a no-op.
    pub async fn finish(&self, status: Status) -> Result<(), RpcError> {
        let mut state = self.send_state.lock().unwrap();
        if *state >= SendState::TrailerSent {
            return Ok(());
        }
        let needs_headers = *state == SendState::Idle;
        *state = SendState::TrailerSent;
        drop(state);
        self.closed.store(true, Ordering::SeqCst);
        if let Some((unregister, id)) = &self.cleanup {
            unregister.unregister_server(*id);
        }

        if needs_headers {
            self.transport
                .send_metadata(self.stream_id, Metadata::for_server_initial_response(), false)
                .await?;
        }
        self.transport
            .send_metadata(
                self.stream_id,
                Metadata::for_trailer(status.code, status.message),
                true,
            )
            .await
    }

    async fn fail_locally(&self, err: RpcError) {
        self.set_recv_state(RecvState::Closed);
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(Err(err)).await;
        let _ = self.finish(Status::new(Code::INTERNAL, "protocol violation")).await;
    }

    fn recv_state(&self) -> RecvState {
        send_to_recv(self.recv_state.load(Ordering::SeqCst))
    }

    fn set_recv_state(&self, s: RecvState) {
        let n = match s {
            RecvState::AwaitingHeaders => 0,
            RecvState::AwaitingPayloads => 1,
            RecvState::AwaitingTrailer => 2,
            RecvState::Closed => 3,
        };
        self.recv_state.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessorSink for StreamProcessor {
    async fn deliver(&self, message: TransportMessage) {
        if self.recv_state() == RecvState::Closed {
            return;
        }

        match message.kind {
            MessageKind::Metadata(md) => match self.recv_state() {
                RecvState::AwaitingHeaders => {
                    if md.flavor() != MetadataFlavor::InitialRequest {
                        self.fail_locally(RpcError::protocol(ProtocolErrorKind::TrailerBeforeHeaders))
                            .await;
                        return;
                    }
                    self.set_recv_state(RecvState::AwaitingPayloads);
                    let _ = self.outbound.send(Ok(CallMessage::Metadata(md))).await;
                }
                RecvState::AwaitingPayloads | RecvState::AwaitingTrailer => {
                    if message.end_stream && md.flavor() == MetadataFlavor::ClientEnd {
                        self.set_recv_state(RecvState::Closed);
                        let _ = self.outbound.send(Ok(CallMessage::Metadata(md))).await;
                    } else {
                        self.fail_locally(RpcError::protocol(ProtocolErrorKind::DuplicateHeaders))
                            .await;
                    }
                }
                RecvState::Closed => {}
            },
            MessageKind::Payload(bytes) => match self.recv_state() {
                RecvState::AwaitingHeaders => {
                    self.fail_locally(RpcError::protocol(ProtocolErrorKind::PayloadBeforeHeaders))
                        .await;
                }
                RecvState::AwaitingPayloads | RecvState::AwaitingTrailer => {
                    let decoded = {
                        let mut parser = self.parser.lock().unwrap();
                        parser.push(&bytes)
                    };
                    match decoded {
                        Ok(frames) => {
                            for frame in frames {
                                if let Err(e) = self.outbound.try_send(Ok(CallMessage::Payload(frame))) {
                                    match e {
                                        mpsc::error::TrySendError::Full(_) => {
                                            self.logger.warn(
                                                "stream_processor",
                                                format!(
                                                    "stream {} inbound queue overflowed",
                                                    self.stream_id
                                                ),
                                            );
                                            self.fail_locally(RpcError::ResourceExhausted(
                                                "inbound queue overflow".to_string(),
                                            ))
                                            .await;
                                        }
                                        mpsc::error::TrySendError::Closed(_) => {
                                            self.set_recv_state(RecvState::Closed);
                                        }
                                    }
                                    return;
                                }
                            }
                        }
                        Err(e) => self.fail_locally(e).await,
                    }
                }
                RecvState::Closed => {}
            },
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
