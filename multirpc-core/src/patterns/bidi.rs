//! Bidirectional streaming: both sides send and observe a sequence of
//! inbound payloads terminated by exactly one Trailer (spec §4.6).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;

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

pub struct BidiCall {
    processor: Arc<CallProcessor>,
    rx: tokio::sync::mpsc::Receiver<Result<CallMessage<bytes::Bytes>, RpcError>>,
    cleanup: Option<(Arc<dyn StreamUnregister>, StreamId)>,
}

impl BidiCall {
    pub async fn start(
        transport: Arc<dyn Transport>,
        stream_id: StreamId,
        path: &str,
        extra_headers: Vec<(String, String)>,
        logger: Logger,
    ) -> Result<Self, RpcError> {
        let (processor, rx) = CallProcessor::start(transport, stream_id, path, extra_headers, logger).await?;
        Ok(BidiCall { processor, rx, cleanup: None })
    }

    /// Wrap an already-registered processor (InitialRequest already sent).
    pub fn from_parts(
        processor: Arc<CallProcessor>,
        rx: tokio::sync::mpsc::Receiver<Result<CallMessage<bytes::Bytes>, RpcError>>,
        cleanup: Option<(Arc<dyn StreamUnregister>, StreamId)>,
    ) -> Self {
        BidiCall { processor, rx, cleanup }
    }

    pub async fn send<Req, RC: Codec<Req>>(&self, req_codec: &RC, request: &Req) -> Result<(), RpcError> {
        let body = encode(req_codec, request)?;
        self.processor.send(&body).await
    }

    pub async fn finish_sending(&self) -> Result<(), RpcError> {
        self.processor.finish_sending().await
    }

    /// Pull the next response, or `None` once the Trailer has arrived with
    /// an OK status.
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

    pub async fn close(&self) {
        self.processor.close().await;
    }
}

impl Drop for BidiCall {
    fn drop(&mut self) {
        if let Some((dispatcher, id)) = self.cleanup.take() {
            dispatcher.unregister_client(id);
        }
    }
}

/// Application logic for a bidirectional responder: consumes the decoded
/// inbound sequence and concurrently pushes outbound responses, returning
/// `Ok(())` on normal completion or `Err(message)` to abort.
#[async_trait]
pub trait BidiHandler<Req, Resp>: Send + Sync {
    async fn handle(
        &self,
        requests: ReceiverStream<Req>,
        responses: tokio::sync::mpsc::Sender<Resp>,
    ) -> Result<(), String>;
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
    H: BidiHandler<Req, Resp> + Send + Sync + 'static,
{
    let (item_tx, item_rx) = tokio::sync::mpsc::channel::<Req>(64);
    let (resp_tx, mut resp_rx) = tokio::sync::mpsc::channel::<Resp>(64);

    let handler_task = tokio::spawn({
        let handler = handler.clone();
        async move { handler.handle(ReceiverStream::new(item_rx), resp_tx).await }
    });

    let forward_out = {
        let processor = processor.clone();
        let resp_codec = resp_codec.clone();
        tokio::spawn(async move {
            let mut headers_sent = false;
            let mut failed = false;
            while let Some(item) = resp_rx.recv().await {
                if failed {
                    continue;
                }
                match encode(resp_codec.as_ref(), &item) {
                    Ok(bytes) => {
                        if !headers_sent {
                            let _ = processor.send_initial_response().await;
                            headers_sent = true;
                        }
                        if processor.send(&bytes).await.is_err() {
                            failed = true;
                        }
                    }
                    Err(_) => failed = true,
                }
            }
            failed
        })
    };

    loop {
        match rx.recv().await {
            None => break,
            Some(Err(_)) => break,
            Some(Ok(CallMessage::Metadata(md))) => {
                if md.flavor() == MetadataFlavor::ClientEnd {
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
                    let _ = forward_out.await;
                    return;
                }
            },
        }
    }
    drop(item_tx);

    let handler_result = handler_task.await;
    let send_failed = forward_out.await.unwrap_or(true);

    match handler_result {
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
