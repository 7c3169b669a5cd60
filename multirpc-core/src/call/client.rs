//! The client-side call processor (spec §4.4).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::call::{CallMessage, ProcessorSink, RecvState, SendState};
use crate::error::{ProtocolErrorKind, RpcError};
use crate::frame::{encode_frame, FrameParser};
use crate::logging::Logger;
use crate::metadata::{Metadata, MetadataFlavor};
use crate::status::{Code, Status};
use crate::stream_id::StreamId;
use crate::transport::{MessageKind, Transport, TransportMessage};

/// Bounded inbound queue depth per stream (spec §9's backpressure knob).
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

fn send_to_recv(n: u8) -> RecvState {
    match n {
        0 => RecvState::AwaitingHeaders,
        1 => RecvState::AwaitingPayloads,
        2 => RecvState::AwaitingTrailer,
        _ => RecvState::Closed,
    }
}

/// Per-call client-side state machine.
///
/// Owned by the pattern engine (Caller) that created it, shared with the
/// dispatcher only as a `ProcessorSink` trait object for routing.
pub struct CallProcessor {
    transport: Arc<dyn Transport>,
    stream_id: StreamId,
    logger: Logger,

    send_state: Mutex<SendState>,
    recv_state: AtomicU8,
    parser: Mutex<FrameParser>,
    closed: AtomicBool,

    /// Holds the sender while the call is still receiving; taken and
    /// dropped the moment a terminal message (the Trailer, in whichever
    /// form) is delivered, so the consumer's `rx.recv()` observes end of
    /// stream. The future driving the call holds an `Arc<CallProcessor>`
    /// for its whole lifetime, so dropping the `Arc` can never be what
    /// closes this channel — the processor has to close it explicitly.
    outbound: Mutex<Option<mpsc::Sender<Result<CallMessage<Bytes>, RpcError>>>>,
}

impl CallProcessor {
    /// Construct a processor without sending anything yet. Split from
    /// [`CallProcessor::start`] so a dispatcher can register the processor
    /// into its routing table before the InitialRequest hits the wire,
    /// closing the race where a fast peer's response arrives before the
    /// caller is listening for it.
    pub fn new(transport: Arc<dyn Transport>, stream_id: StreamId, logger: Logger) -> (Arc<Self>, mpsc::Receiver<Result<CallMessage<Bytes>, RpcError>>) {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_DEPTH);
        let processor = Arc::new(CallProcessor {
            transport,
            stream_id,
            logger,
            send_state: Mutex::new(SendState::Idle),
            recv_state: AtomicU8::new(0),
            parser: Mutex::new(FrameParser::new()),
            closed: AtomicBool::new(false),
            outbound: Mutex::new(Some(tx)),
        });
        (processor, rx)
    }

    /// Send the InitialRequest metadata that opens the call.
    pub async fn send_initial(&self, path: &str, extra_headers: Vec<(String, String)>) -> Result<(), RpcError> {
        let md = Metadata::for_client_initial(path, extra_headers);
        self.transport.send_metadata(self.stream_id, md, false).await?;
        *self.send_state.lock().unwrap() = SendState::HeadersSent;
        Ok(())
    }

    /// Construct a processor and send the InitialRequest metadata in one
    /// step. Convenient for standalone use outside a dispatcher (e.g.
    /// tests driving a `CallProcessor` directly against a transport).
    pub async fn start(
        transport: Arc<dyn Transport>,
        stream_id: StreamId,
        path: &str,
        extra_headers: Vec<(String, String)>,
        logger: Logger,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Result<CallMessage<Bytes>, RpcError>>), RpcError> {
        let (processor, rx) = CallProcessor::new(transport, stream_id, logger);
        processor.send_initial(path, extra_headers).await?;
        Ok((processor, rx))
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Serialize is the pattern engine's job; this takes already-encoded
    /// request bytes and frames/sends them.
    pub async fn send(&self, payload: &[u8]) -> Result<(), RpcError> {
        {
            let mut state = self.send_state.lock().unwrap();
            if *state >= SendState::TrailerSent {
                return Err(RpcError::ClosedStream);
            }
            *state = SendState::Streaming;
        }
        let frame = encode_frame(payload);
        self.transport.send_message(self.stream_id, frame).await
    }

    /// Idempotent: closes the request direction with a metadata frame
    /// carrying `end_stream=true` (spec §4.4, §9's sentinel-avoidance
    /// resolution).
    pub async fn finish_sending(&self) -> Result<(), RpcError> {
        let mut state = self.send_state.lock().unwrap();
        if *state >= SendState::TrailerSent {
            return Ok(());
        }
        *state = SendState::TrailerSent;
        drop(state);
        self.transport
            .send_metadata(self.stream_id, Metadata::for_client_end(), true)
            .await
    }

    /// Cancel locally: unsubscribe, emit a local CANCELLED to the
    /// consumer if not already done, and send a best-effort cancel
    /// metadata. Calling this twice is a no-op the second time (spec
    /// property 6).
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return; // idempotent
        }

        let recv_done = send_to_recv(self.recv_state.load(Ordering::SeqCst)) == RecvState::Closed;
        if !recv_done {
            if let Some(sender) = self.outbound.lock().unwrap().take() {
                let _ = sender.try_send(Err(RpcError::Cancelled));
            }
        }
        self.recv_state.store(3, Ordering::SeqCst);

        let _ = self
            .transport
            .send_metadata(
                self.stream_id,
                Metadata::for_trailer(Code::CANCELLED, "cancelled by caller"),
                true,
            )
            .await;
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

    async fn fail(&self, err: RpcError) {
        self.set_recv_state(RecvState::Closed);
        self.closed.store(true, Ordering::SeqCst);
        self.emit_final(Err(err)).await;
    }

    fn sender(&self) -> Option<mpsc::Sender<Result<CallMessage<Bytes>, RpcError>>> {
        self.outbound.lock().unwrap().clone()
    }

    /// Forward a non-terminal message; the channel stays open.
    async fn emit(&self, msg: Result<CallMessage<Bytes>, RpcError>) {
        if let Some(sender) = self.sender() {
            let _ = sender.send(msg).await;
        }
    }

    /// Forward the call's terminal message and close the channel: takes
    /// and drops the sender once this send completes, so the consumer's
    /// next `recv()` observes `None` instead of blocking forever.
    async fn emit_final(&self, msg: Result<CallMessage<Bytes>, RpcError>) {
        let sender = self.outbound.lock().unwrap().take();
        if let Some(sender) = sender {
            let _ = sender.send(msg).await;
        }
    }
}

#[async_trait]
impl ProcessorSink for CallProcessor {
    async fn deliver(&self, message: TransportMessage) {
        if self.recv_state() == RecvState::Closed {
            return;
        }

        match message.kind {
            MessageKind::Metadata(md) => {
                match self.recv_state() {
                    RecvState::AwaitingHeaders => {
                        if md.flavor() == MetadataFlavor::Trailer {
                            if !message.end_stream {
                                self.fail(RpcError::protocol(ProtocolErrorKind::TrailerBeforeHeaders))
                                    .await;
                                return;
                            }
                            // Trailers-only response: no InitialResponse ever
                            // preceded this Trailer (e.g. an UNIMPLEMENTED
                            // reply to an unknown method).
                            let status = md
                                .status()
                                .unwrap_or_else(|| Status::new(Code::INTERNAL, "missing grpc-status"));
                            self.set_recv_state(RecvState::Closed);
                            self.closed.store(true, Ordering::SeqCst);
                            if status.is_ok() {
                                self.emit_final(Ok(CallMessage::Metadata(md))).await;
                            } else {
                                self.emit_final(Err(RpcError::status(status))).await;
                            }
                            return;
                        }
                        self.set_recv_state(RecvState::AwaitingPayloads);
                        self.emit(Ok(CallMessage::Metadata(md))).await;
                    }
                    RecvState::AwaitingPayloads | RecvState::AwaitingTrailer => {
                        if message.end_stream {
                            let status = md
                                .status()
                                .unwrap_or_else(|| Status::new(Code::INTERNAL, "missing grpc-status"));
                            self.set_recv_state(RecvState::Closed);
                            self.closed.store(true, Ordering::SeqCst);
                            if status.is_ok() {
                                self.emit_final(Ok(CallMessage::Metadata(md))).await;
                            } else {
                                self.emit_final(Err(RpcError::status(status))).await;
                            }
                        } else {
                            self.fail(RpcError::protocol(ProtocolErrorKind::DuplicateHeaders))
                                .await;
                        }
                    }
                    RecvState::Closed => {}
                }
            }
            MessageKind::Payload(bytes) => match self.recv_state() {
                RecvState::AwaitingHeaders => {
                    self.fail(RpcError::protocol(ProtocolErrorKind::PayloadBeforeHeaders))
                        .await;
                }
                RecvState::AwaitingPayloads | RecvState::AwaitingTrailer => {
                    let decoded = {
                        let mut parser = self.parser.lock().unwrap();
                        parser.push(&bytes)
                    };
                    match decoded {
                        Ok(frames) => {
                            let Some(sender) = self.sender() else {
                                return; // channel already closed, nothing to forward
                            };
                            for frame in frames {
                                if let Err(e) = sender.try_send(Ok(CallMessage::Payload(frame))) {
                                    match e {
                                        mpsc::error::TrySendError::Full(_) => {
                                            self.logger.warn(
                                                "call_processor",
                                                format!(
                                                    "stream {} inbound queue overflowed",
                                                    self.stream_id
                                                ),
                                            );
                                            self.fail(RpcError::ResourceExhausted(
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
                        Err(e) => self.fail(e).await,
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
