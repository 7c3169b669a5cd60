//! Demultiplexer routing inbound `TransportMessage`s to the right
//! processor, and lazily instantiating server-side processors for newly
//! observed streams (spec §4.7).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::call::client::CallProcessor;
use crate::call::server::StreamProcessor;
use crate::call::{CallMessage, ProcessorSink, StreamUnregister};
use crate::codec::Codec;
use crate::error::RpcError;
use crate::logging::Logger;
use crate::metadata::{Metadata, MetadataFlavor};
use crate::patterns::{bidi, client_stream, server_stream, unary};
use crate::status::Code;
use crate::stream_id::{StreamId, StreamIdAllocator};
use crate::transport::{MessageKind, Transport, TransportMessage};

type InboundRx = mpsc::Receiver<Result<CallMessage<bytes::Bytes>, RpcError>>;

/// Per-dispatcher tunables supplementing per-call defaults.
#[derive(Clone)]
pub struct DispatcherOptions {
    /// Caller-side default timeout applied when a pattern-engine call site
    /// doesn't specify its own.
    pub default_timeout: Option<Duration>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        DispatcherOptions { default_timeout: None }
    }
}

#[async_trait]
trait ResponderEntry: Send + Sync {
    async fn serve(&self, processor: Arc<StreamProcessor>, rx: InboundRx);
}

struct UnaryEntry<Req, Resp, RC, PC, H> {
    req_codec: Arc<RC>,
    resp_codec: Arc<PC>,
    handler: Arc<H>,
    _types: std::marker::PhantomData<fn() -> (Req, Resp)>,
}

#[async_trait]
impl<Req, Resp, RC, PC, H> ResponderEntry for UnaryEntry<Req, Resp, RC, PC, H>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    RC: Codec<Req> + Send + Sync + 'static,
    PC: Codec<Resp> + Send + Sync + 'static,
    H: unary::UnaryHandler<Req, Resp> + Send + Sync + 'static,
{
    async fn serve(&self, processor: Arc<StreamProcessor>, rx: InboundRx) {
        unary::serve(processor, rx, self.req_codec.clone(), self.resp_codec.clone(), self.handler.clone()).await
    }
}

struct ClientStreamEntry<Req, Resp, RC, PC, H> {
    req_codec: Arc<RC>,
    resp_codec: Arc<PC>,
    handler: Arc<H>,
    _types: std::marker::PhantomData<fn() -> (Req, Resp)>,
}

#[async_trait]
impl<Req, Resp, RC, PC, H> ResponderEntry for ClientStreamEntry<Req, Resp, RC, PC, H>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    RC: Codec<Req> + Send + Sync + 'static,
    PC: Codec<Resp> + Send + Sync + 'static,
    H: client_stream::ClientStreamHandler<Req, Resp> + Send + Sync + 'static,
{
    async fn serve(&self, processor: Arc<StreamProcessor>, rx: InboundRx) {
        client_stream::serve(processor, rx, self.req_codec.clone(), self.resp_codec.clone(), self.handler.clone()).await
    }
}

struct ServerStreamEntry<Req, Resp, RC, PC, H> {
    req_codec: Arc<RC>,
    resp_codec: Arc<PC>,
    handler: Arc<H>,
    _types: std::marker::PhantomData<fn() -> (Req, Resp)>,
}

#[async_trait]
impl<Req, Resp, RC, PC, H> ResponderEntry for ServerStreamEntry<Req, Resp, RC, PC, H>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    RC: Codec<Req> + Send + Sync + 'static,
    PC: Codec<Resp> + Send + Sync + 'static,
    H: server_stream::ServerStreamHandler<Req, Resp> + Send + Sync + 'static,
{
    async fn serve(&self, processor: Arc<StreamProcessor>, rx: InboundRx) {
        server_stream::serve(processor, rx, self.req_codec.clone(), self.resp_codec.clone(), self.handler.clone()).await
    }
}

struct BidiEntry<Req, Resp, RC, PC, H> {
    req_codec: Arc<RC>,
    resp_codec: Arc<PC>,
    handler: Arc<H>,
    _types: std::marker::PhantomData<fn() -> (Req, Resp)>,
}

#[async_trait]
impl<Req, Resp, RC, PC, H> ResponderEntry for BidiEntry<Req, Resp, RC, PC, H>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    RC: Codec<Req> + Send + Sync + 'static,
    PC: Codec<Resp> + Send + Sync + 'static,
    H: bidi::BidiHandler<Req, Resp> + Send + Sync + 'static,
{
    async fn serve(&self, processor: Arc<StreamProcessor>, rx: InboundRx) {
        bidi::serve(processor, rx, self.req_codec.clone(), self.resp_codec.clone(), self.handler.clone()).await
    }
}

/// Per-transport demultiplexer. Owns the transport's single inbound
/// sequence and two routing tables keyed by `StreamId` (spec §4.7).
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    logger: Logger,
    options: DispatcherOptions,
    stream_alloc: StreamIdAllocator,
    client_processors: Mutex<HashMap<StreamId, Arc<dyn ProcessorSink>>>,
    server_processors: Mutex<HashMap<StreamId, Arc<dyn ProcessorSink>>>,
    responders: Mutex<HashMap<String, Arc<dyn ResponderEntry>>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, logger: Logger, options: DispatcherOptions) -> Arc<Self> {
        Arc::new(Dispatcher {
            transport,
            logger,
            options,
            stream_alloc: StreamIdAllocator::new(),
            client_processors: Mutex::new(HashMap::new()),
            server_processors: Mutex::new(HashMap::new()),
            responders: Mutex::new(HashMap::new()),
        })
    }

    pub fn logger(&self) -> Logger {
        self.logger.clone()
    }

    /// Register a unary responder. Fails if `path` is already registered
    /// (spec §4.7 tie-break: "registration fails at setup time").
    pub fn register_unary<Req, Resp, RC, PC, H>(
        &self,
        path: impl Into<String>,
        req_codec: RC,
        resp_codec: PC,
        handler: H,
    ) -> Result<(), RpcError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        RC: Codec<Req> + Send + Sync + 'static,
        PC: Codec<Resp> + Send + Sync + 'static,
        H: unary::UnaryHandler<Req, Resp> + Send + Sync + 'static,
    {
        self.insert_responder(
            path.into(),
            Arc::new(UnaryEntry {
                req_codec: Arc::new(req_codec),
                resp_codec: Arc::new(resp_codec),
                handler: Arc::new(handler),
                _types: std::marker::PhantomData,
            }),
        )
    }

    pub fn register_client_stream<Req, Resp, RC, PC, H>(
        &self,
        path: impl Into<String>,
        req_codec: RC,
        resp_codec: PC,
        handler: H,
    ) -> Result<(), RpcError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        RC: Codec<Req> + Send + Sync + 'static,
        PC: Codec<Resp> + Send + Sync + 'static,
        H: client_stream::ClientStreamHandler<Req, Resp> + Send + Sync + 'static,
    {
        self.insert_responder(
            path.into(),
            Arc::new(ClientStreamEntry {
                req_codec: Arc::new(req_codec),
                resp_codec: Arc::new(resp_codec),
                handler: Arc::new(handler),
                _types: std::marker::PhantomData,
            }),
        )
    }

    pub fn register_server_stream<Req, Resp, RC, PC, H>(
        &self,
        path: impl Into<String>,
        req_codec: RC,
        resp_codec: PC,
        handler: H,
    ) -> Result<(), RpcError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        RC: Codec<Req> + Send + Sync + 'static,
        PC: Codec<Resp> + Send + Sync + 'static,
        H: server_stream::ServerStreamHandler<Req, Resp> + Send + Sync + 'static,
    {
        self.insert_responder(
            path.into(),
            Arc::new(ServerStreamEntry {
                req_codec: Arc::new(req_codec),
                resp_codec: Arc::new(resp_codec),
                handler: Arc::new(handler),
                _types: std::marker::PhantomData,
            }),
        )
    }

    pub fn register_bidi<Req, Resp, RC, PC, H>(
        &self,
        path: impl Into<String>,
        req_codec: RC,
        resp_codec: PC,
        handler: H,
    ) -> Result<(), RpcError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        RC: Codec<Req> + Send + Sync + 'static,
        PC: Codec<Resp> + Send + Sync + 'static,
        H: bidi::BidiHandler<Req, Resp> + Send + Sync + 'static,
    {
        self.insert_responder(
            path.into(),
            Arc::new(BidiEntry {
                req_codec: Arc::new(req_codec),
                resp_codec: Arc::new(resp_codec),
                handler: Arc::new(handler),
                _types: std::marker::PhantomData,
            }),
        )
    }

    fn insert_responder(&self, path: String, entry: Arc<dyn ResponderEntry>) -> Result<(), RpcError> {
        let mut responders = self.responders.lock().unwrap();
        if responders.contains_key(&path) {
            return Err(RpcError::Handler(format!("a responder is already registered for {path}")));
        }
        responders.insert(path, entry);
        Ok(())
    }

    /// Spawn the transport's receive loop. May be called once per
    /// dispatcher instance (the transport's `take_incoming` enforces the
    /// single-consumer rule).
    pub fn run(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.run_loop().await });
    }

    async fn run_loop(self: Arc<Self>) {
        let mut incoming = match self.transport.take_incoming() {
            Some(stream) => stream,
            None => {
                self.logger.error("dispatcher", "take_incoming returned None: already consumed");
                return;
            }
        };
        while let Some(message) = incoming.next().await {
            self.route(message).await;
        }
    }

    fn lookup(&self, id: StreamId) -> Option<Arc<dyn ProcessorSink>> {
        if let Some(sink) = self.client_processors.lock().unwrap().get(&id) {
            return Some(sink.clone());
        }
        self.server_processors.lock().unwrap().get(&id).cloned()
    }

    fn remove(&self, id: StreamId) {
        self.client_processors.lock().unwrap().remove(&id);
        self.server_processors.lock().unwrap().remove(&id);
    }

    async fn route(self: &Arc<Self>, message: TransportMessage) {
        let id = message.stream_id;

        if let Some(sink) = self.lookup(id) {
            sink.deliver(message).await;
            if sink.is_closed() {
                self.remove(id);
            }
            return;
        }

        let is_initial_request =
            matches!(&message.kind, MessageKind::Metadata(md) if md.flavor() == MetadataFlavor::InitialRequest);
        if !is_initial_request {
            self.logger.warn("dispatcher", format!("dropping message for unknown stream {id}"));
            return;
        }

        let path = match &message.kind {
            MessageKind::Metadata(md) => md.path().unwrap_or("").to_string(),
            MessageKind::Payload(_) => unreachable!("checked above"),
        };

        let entry = self.responders.lock().unwrap().get(&path).cloned();
        match entry {
            Some(entry) => {
                let (processor, rx) =
                    StreamProcessor::new(self.transport.clone(), id, self.logger.clone(), self.cleanup_handle(id));
                self.server_processors
                    .lock()
                    .unwrap()
                    .insert(id, processor.clone() as Arc<dyn ProcessorSink>);
                let serve_processor = processor.clone();
                tokio::spawn(async move { entry.serve(serve_processor, rx).await });
                processor.deliver(message).await;
                if processor.is_closed() {
                    self.remove(id);
                }
            }
            None => {
                self.logger.warn("dispatcher", format!("no responder registered for {path}"));
                let _ = self
                    .transport
                    .send_metadata(id, Metadata::for_trailer(Code::UNIMPLEMENTED, "method not found"), true)
                    .await;
            }
        }
    }

    fn new_client_processor(self: &Arc<Self>) -> (StreamId, Arc<CallProcessor>, InboundRx) {
        let id = self.stream_alloc.allocate();
        let (processor, rx) = CallProcessor::new(self.transport.clone(), id, self.logger.clone());
        self.client_processors
            .lock()
            .unwrap()
            .insert(id, processor.clone() as Arc<dyn ProcessorSink>);
        (id, processor, rx)
    }

    fn cleanup_handle(self: &Arc<Self>, id: StreamId) -> Option<(Arc<dyn StreamUnregister>, StreamId)> {
        Some((self.clone() as Arc<dyn StreamUnregister>, id))
    }

    /// Drive one unary call over a fresh stream, registering it before the
    /// InitialRequest goes on the wire.
    pub async fn call_unary<Req, Resp, RC, PC>(
        self: &Arc<Self>,
        path: &str,
        extra_headers: Vec<(String, String)>,
        req_codec: &RC,
        resp_codec: &PC,
        request: Req,
        timeout: Option<Duration>,
    ) -> Result<Resp, RpcError>
    where
        RC: Codec<Req>,
        PC: Codec<Resp>,
    {
        let (id, processor, rx) = self.new_client_processor();
        let timeout = timeout.or(self.options.default_timeout);
        let result = async move {
            processor.send_initial(path, extra_headers).await?;
            unary::call(processor, rx, req_codec, resp_codec, request, timeout).await
        }
        .await;
        self.remove(id);
        result
    }

    /// Open a client-streaming call, registered before any bytes are sent.
    pub async fn open_client_stream<Resp>(
        self: &Arc<Self>,
        path: &str,
        extra_headers: Vec<(String, String)>,
    ) -> Result<client_stream::ClientStreamCall<Resp>, RpcError> {
        let (id, processor, rx) = self.new_client_processor();
        processor.send_initial(path, extra_headers).await?;
        Ok(client_stream::ClientStreamCall::from_parts(processor, rx, self.cleanup_handle(id)))
    }

    /// Open a server-streaming call, registered before any bytes are sent.
    pub async fn open_server_stream(
        self: &Arc<Self>,
        path: &str,
        extra_headers: Vec<(String, String)>,
    ) -> Result<server_stream::ServerStreamCall, RpcError> {
        let (id, processor, rx) = self.new_client_processor();
        processor.send_initial(path, extra_headers).await?;
        Ok(server_stream::ServerStreamCall::from_parts(processor, rx, self.cleanup_handle(id)))
    }

    /// Open a bidirectional call, registered before any bytes are sent.
    pub async fn open_bidi(
        self: &Arc<Self>,
        path: &str,
        extra_headers: Vec<(String, String)>,
    ) -> Result<bidi::BidiCall, RpcError> {
        let (id, processor, rx) = self.new_client_processor();
        processor.send_initial(path, extra_headers).await?;
        Ok(bidi::BidiCall::from_parts(processor, rx, self.cleanup_handle(id)))
    }
}

impl StreamUnregister for Dispatcher {
    fn unregister_client(&self, id: StreamId) {
        self.client_processors.lock().unwrap().remove(&id);
    }

    fn unregister_server(&self, id: StreamId) {
        self.server_processors.lock().unwrap().remove(&id);
    }
}
