//! Client-streaming: many requests, exactly one response (spec §4.6).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;

use crate::call::client::CallProcessor;
use crate::call::server::StreamProcessor;
use crate::call::{CallMessage, StreamUnregister};
use crate::codec::Codec;
use crate::error::{ProtocolErrorKind, RpcError};
use crate::logging::Logger;
use crate::metadata::MetadataFlavor;
use crate::status::{Code, Status};
use crate::stream_id::StreamId;
use crate::transport::Transport;

use super::{decode, encode};

/// A live client-streaming call. `send` may be called any number of times
/// before `finish`.
pub struct ClientStreamCall<Resp> {
    processor: Arc<CallProcessor>,
    rx: tokio::sync::mpsc::Receiver<Result<CallMessage<bytes::Bytes>, RpcError>>,
    cleanup: Option<(Arc<dyn StreamUnregister>, StreamId)>,
    _resp: std::marker::PhantomData<Resp>,
}

impl<Resp> ClientStreamCall<Resp> {
    pub async fn start(
        transport: Arc<dyn Transport>,
        stream_id: StreamId,
        path: &str,
        extra_headers: Vec<(String, String)>,
        logger: Logger,
    ) -> Result<Self, RpcError> {
        let (processor, rx) = CallProcessor::start(transport, stream_id, path, extra_headers, logger).await?;
        Ok(ClientStreamCall {
            processor,
            rx,
            cleanup: None,
            _resp: std::marker::PhantomData,
        })
    }

    /// Wrap an already-registered processor (InitialRequest already sent),
    /// for use by a [`crate::dispatcher::Dispatcher`] that needs to
    /// register the stream before any bytes hit the wire. `cleanup` drops
    /// the stream id from the dispatcher's routing table once this call
    /// ends, whichever way it ends.
    pub fn from_parts(
        processor: Arc<CallProcessor>,
        rx: tokio::sync::mpsc::Receiver<Result<CallMessage<bytes::Bytes>, RpcError>>,
        cleanup: Option<(Arc<dyn StreamUnregister>, StreamId)>,
    ) -> Self {
        ClientStreamCall {
            processor,
            rx,
            cleanup,
            _resp: std::marker::PhantomData,
        }
    }

    pub async fn send<Req, RC: Codec<Req>>(&self, req_codec: &RC, request: &Req) -> Result<(), RpcError> {
        let body = encode(req_codec, request)?;
        self.processor.send(&body).await
    }

    /// Half-close the request direction and await the single response.
    pub async fn finish<PC: Codec<Resp>>(mut self, resp_codec: &PC) -> Result<Resp, RpcError> {
        self.processor.finish_sending().await?;

        let mut response: Option<Resp> = None;
        loop {
            match self.rx.recv().await {
                None => break,
                Some(Err(e)) => return Err(e),
                Some(Ok(CallMessage::Metadata(_md))) => {}
                Some(Ok(CallMessage::Payload(bytes))) => {
                    if response.is_some() {
                        return Err(RpcError::protocol(ProtocolErrorKind::ExtraUnaryPayload));
                    }
                    response = Some(decode(resp_codec, &bytes)?);
                }
            }
        }

        response.ok_or_else(|| RpcError::status(Status::new(Code::INTERNAL, "stream closed without a response")))
    }
}

impl<Resp> Drop for ClientStreamCall<Resp> {
    fn drop(&mut self) {
        if let Some((dispatcher, id)) = self.cleanup.take() {
            dispatcher.unregister_client(id);
        }
    }
}

/// Application logic for a client-streaming responder: consumes the
/// decoded request sequence and yields exactly one response.
#[async_trait]
pub trait ClientStreamHandler<Req, Resp>: Send + Sync {
    async fn handle(&self, requests: ReceiverStream<Req>) -> Result<Resp, String>;
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
    H: ClientStreamHandler<Req, Resp> + Send + Sync + 'static,
{
    let (item_tx, item_rx) = tokio::sync::mpsc::channel::<Req>(64);
    let handler_task = {
        let handler = handler.clone();
        tokio::spawn(async move { handler.handle(ReceiverStream::new(item_rx)).await })
    };

    loop {
        match rx.recv().await {
            None => {
                drop(item_tx);
                break;
            }
            Some(Err(_)) => {
                drop(item_tx);
                break;
            }
            Some(Ok(CallMessage::Metadata(md))) => {
                if md.flavor() == MetadataFlavor::ClientEnd {
                    drop(item_tx);
                    break;
                }
            }
            Some(Ok(CallMessage::Payload(bytes))) => match decode(req_codec.as_ref(), &bytes) {
                Ok(req) => {
                    if item_tx.send(req).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    drop(item_tx);
                    let _ = processor.finish(e.to_status()).await;
                    let _ = handler_task.await;
                    return;
                }
            },
        }
    }

    match handler_task.await {
        Ok(Ok(response)) => match encode(resp_codec.as_ref(), &response) {
            Ok(bytes) => {
                let _ = processor.send_initial_response().await;
                if processor.send(&bytes).await.is_ok() {
                    let _ = processor.finish(Status::ok()).await;
                } else {
                    let _ = processor.finish(Status::new(Code::UNAVAILABLE, "send failed")).await;
                }
            }
            Err(e) => {
                let _ = processor.finish(e.to_status()).await;
            }
        },
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
