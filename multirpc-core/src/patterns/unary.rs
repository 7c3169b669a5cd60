//! Unary: exactly one request, exactly one response (spec §4.6).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::call::client::CallProcessor;
use crate::call::server::StreamProcessor;
use crate::call::CallMessage;
use crate::codec::Codec;
use crate::error::{ProtocolErrorKind, RpcError};
use crate::status::{Code, Status};

use super::{decode, encode, with_timeout};

/// Drive one unary call to completion over an already-registered
/// `processor` (InitialRequest already sent): send the single request,
/// half-close, and wait for exactly one response payload followed by an OK
/// trailer.
pub async fn call<Req, Resp, RC, PC>(
    processor: Arc<CallProcessor>,
    mut rx: tokio::sync::mpsc::Receiver<Result<CallMessage<bytes::Bytes>, RpcError>>,
    req_codec: &RC,
    resp_codec: &PC,
    request: Req,
    timeout: Option<Duration>,
) -> Result<Resp, RpcError>
where
    RC: Codec<Req>,
    PC: Codec<Resp>,
{
    let body = encode(req_codec, &request)?;

    let drive = async {
        processor.send(&body).await?;
        processor.finish_sending().await?;

        let mut response: Option<Resp> = None;
        loop {
            match rx.recv().await {
                None => break,
                Some(Err(e)) => return Err(e),
                Some(Ok(CallMessage::Metadata(_md))) => {
                    // Either the InitialResponse (ignored) or the final OK
                    // trailer, which ends the sequence naturally below.
                }
                Some(Ok(CallMessage::Payload(bytes))) => {
                    if response.is_some() {
                        return Err(RpcError::protocol(ProtocolErrorKind::ExtraUnaryPayload));
                    }
                    response = Some(decode(resp_codec, &bytes)?);
                }
            }
        }

        response.ok_or_else(|| RpcError::status(Status::new(Code::INTERNAL, "stream closed without a response")))
    };

    match with_timeout(timeout, drive).await {
        Ok(resp) => Ok(resp),
        Err(e @ RpcError::Timeout) => {
            processor.close().await;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Application logic for a unary responder.
#[async_trait]
pub trait UnaryHandler<Req, Resp>: Send + Sync {
    async fn handle(&self, request: Req) -> Result<Resp, String>;
}

/// Drive a unary responder over an already-constructed [`StreamProcessor`]
/// whose first request has already been delivered (spec §4.5, §4.6).
pub async fn serve<Req, Resp, RC, PC, H>(
    processor: Arc<StreamProcessor>,
    mut rx: tokio::sync::mpsc::Receiver<Result<CallMessage<bytes::Bytes>, RpcError>>,
    req_codec: Arc<RC>,
    resp_codec: Arc<PC>,
    handler: Arc<H>,
) where
    RC: Codec<Req> + Send + Sync + 'static,
    PC: Codec<Resp> + Send + Sync + 'static,
    H: UnaryHandler<Req, Resp> + 'static,
{
    let mut request: Option<Req> = None;

    loop {
        match rx.recv().await {
            None => return,
            Some(Err(_)) => return,
            Some(Ok(CallMessage::Metadata(md))) => {
                if md.flavor() == crate::metadata::MetadataFlavor::ClientEnd {
                    break;
                }
                // InitialRequest metadata, already consumed by the dispatcher.
            }
            Some(Ok(CallMessage::Payload(bytes))) => {
                if request.is_some() {
                    let _ = processor
                        .finish(Status::new(Code::INVALID_ARGUMENT, "unary method received more than one request"))
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
                .finish(Status::new(Code::INVALID_ARGUMENT, "unary method received no request"))
                .await;
            return;
        }
    };

    match handler.handle(request).await {
        Ok(response) => match encode(resp_codec.as_ref(), &response) {
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
        Err(message) => {
            let _ = processor.finish(Status::new(Code::INTERNAL, message)).await;
        }
    }
}
