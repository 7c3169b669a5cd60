//! Server-streaming: exactly one request, many responses (spec §4.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::call::client::CallProcessor;
use crate::call::server::StreamProcessor;
use crate::call::{CallMessage, StreamUnregister};
use crate::codec::Codec;
use crate::error::RpcError;
use crate::logging::Logger;
use crate::metadata::MetadataFlavor;
use crate::status::{Code, Status};
use crate::stream_id::StreamId;
use crate::transport::Transport;

use super::{decode, encode};

pub struct ServerStreamCall {
    processor: Arc<CallProcessor>,
    rx: tokio::sync::mpsc::Receiver<Result<CallMessage<bytes::Bytes>, RpcError>>,
    sent: AtomicBool,
    cleanup: Option<(Arc<dyn StreamUnregister>, StreamId)>,
}

impl ServerStreamCall {
    pub async fn start(
        transport: Arc<dyn Transport>,
        stream_id: StreamId,
        path: &str,
        extra_headers: Vec<(String, String)>,
        logger: Logger,
    ) -> Result<Self, RpcError> {
        let (processor, rx) = CallProcessor::start(transport, stream_id, path, extra_headers, logger).await?;
        Ok(ServerStreamCall {
            processor,
            rx,
            sent: AtomicBool::new(false),
            cleanup: None,
        })
    }

    /// Wrap an already-registered processor (InitialRequest already sent).
    pub fn from_parts(
        processor: Arc<CallProcessor>,
        rx: tokio::sync::mpsc::Receiver<Result<CallMessage<bytes::Bytes>, RpcError>>,
        cleanup: Option<(Arc<dyn StreamUnregister>, StreamId)>,
    ) -> Self {
        ServerStreamCall {
            processor,
            rx,
            sent: AtomicBool::new(false),
            cleanup,
        }
    }

    /// Send the single request and half-close. A second call is a local
    /// error (spec §4.6: "Additional `send` after the first is a local
    /// error").
    pub async fn send_request<Req, RC: Codec<Req>>(&self, req_codec: &RC, request: &Req) -> Result<(), RpcError> {
        if self.sent.swap(true, Ordering::SeqCst) {
            return Err(RpcError::ClosedStream);
        }
        let body = encode(req_codec, request)?;
        self.processor.send(&body).await?;
        self.processor.finish_sending().await
    }

    /// Pull the next response, or `None` once the Trailer has arrived with
    /// an OK status. A non-OK trailer surfaces as `Err`.
    pub async fn recv<Resp, PC: Codec<Resp>>(&mut self, resp_codec: &PC) -> Result<Option<Resp>, RpcError> {
        loop {
            match self.rx.recv().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e),
                Some(Ok(CallMessage::Metadata(_md))) => continue,
                Some(Ok(CallMessage::Payload(bytes))) => return Ok(Some(decode(resp_codec, &bytes)?)),
            }
        }
    }
}

impl Drop for ServerStreamCall {
    fn drop(&mut self) {
        if let Some((dispatcher, id)) = self.cleanup.take() {
            dispatcher.unregister_client(id);
        }
    }
}

/// Application logic for a server-streaming responder: given the single
/// request, pushes zero or more responses through `responses` and returns
/// `Ok(())` on normal completion or `Err(message)` to abort mid-stream.
#[async_trait]
pub trait ServerStreamHandler<Req, Resp>: Send + Sync {
    async fn handle(&self, request: Req, responses: tokio::sync::mpsc::Sender<Resp>) -> Result<(), String>;
}

pub async fn serve<Req, Resp, RC, PC, H>(
    processor: Arc<StreamProcessor>,
    mut rx: tokio::sync::mpsc::Receiver<Result<CallMessage<bytes::Bytes>, RpcError>>,
    req_codec: Arc<RC>,
    resp_codec: Arc<PC>,
    handler: Arc<H>,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
    RC: Codec<Req> + Send + Sync + 'static,
    PC: Codec<Resp> + Send + Sync + 'static,
    H: ServerStreamHandler<Req, Resp> + Send + Sync + 'static,
{
    let mut request: Option<Req> = None;
    loop {
        match rx.recv().await {
            None => return,
            Some(Err(_)) => return,
            Some(Ok(CallMessage::Metadata(md))) => {
                if md.flavor() == MetadataFlavor::ClientEnd {
                    break;
                }
            }
            Some(Ok(CallMessage::Payload(bytes))) => {
                if request.is_some() {
                    let _ = processor
                        .finish(Status::new(
                            Code::INVALID_ARGUMENT,
                            "server-streaming method received more than one request",
                        ))
                        .await;
                    return;
                }
                match decode(req_codec.as_ref(), &bytes) {
                    Ok(req) => request = Some(req),
                    Err(e) => {
                        let _ = processor.finish(e.to_status()).await;
                        return;
                    }
                }
            }
        }
    }

    let request = match request {
        Some(r) => r,
        None => {
            let _ = processor
                .finish(Status::new(Code::INVALID_ARGUMENT, "server-streaming method received no request"))
                .await;
            return;
        }
    };

    let (tx, mut out_rx) = tokio::sync::mpsc::channel::<Resp>(64);
    let handler_task = tokio::spawn({
        let handler = handler.clone();
        async move { handler.handle(request, tx).await }
    });

    let mut headers_sent = false;
    let mut send_failed = false;
    while let Some(item) = out_rx.recv().await {
        if send_failed {
            continue; // drain without blocking the handler
        }
        match encode(resp_codec.as_ref(), &item) {
            Ok(bytes) => {
                if !headers_sent {
                    let _ = processor.send_initial_response().await;
                    headers_sent = true;
                }
                if processor.send(&bytes).await.is_err() {
                    send_failed = true;
                }
            }
            Err(_) => send_failed = true,
        }
    }

    match handler_task.await {
        Ok(Ok(())) => {
            let status = if send_failed {
                Status::new(Code::UNAVAILABLE, "send failed")
            } else {
                Status::ok()
            };
            let _ = processor.finish(status).await;
        }
        Ok(Err(message)) => {
            let _ = processor.finish(Status::new(Code::INTERNAL, message)).await;
        }
        Err(join_err) => {
            let _ = processor
                .finish(Status::new(Code::INTERNAL, format!("handler panicked: {join_err}")))
                .await;
        }
    }
}
