//! An in-memory duplex [`Transport`] pair: two endpoints wired directly to
//! each other's inbound queue, with no serialization or real I/O. Used to
//! exercise `multirpc-core` in tests and same-process demos without a real
//! socket.

use std::sync::Mutex;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use multirpc_core::{Metadata, RpcError, StreamId, Transport, TransportMessage};

/// One end of an in-memory transport pair. Sends go straight to the
/// peer's inbound queue; `take_incoming` hands out this endpoint's own
/// queue exactly once.
pub struct MemoryTransport {
    outgoing: Mutex<Option<mpsc::UnboundedSender<TransportMessage>>>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<TransportMessage>>>,
}

/// Build two endpoints wired to each other: messages sent on `a` arrive on
/// `b`'s incoming sequence, and vice versa.
pub fn pair() -> (std::sync::Arc<MemoryTransport>, std::sync::Arc<MemoryTransport>) {
    let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
    let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();

    let a = std::sync::Arc::new(MemoryTransport {
        outgoing: Mutex::new(Some(a_to_b_tx)),
        incoming: Mutex::new(Some(b_to_a_rx)),
    });
    let b = std::sync::Arc::new(MemoryTransport {
        outgoing: Mutex::new(Some(b_to_a_tx)),
        incoming: Mutex::new(Some(a_to_b_rx)),
    });

    (a, b)
}

impl MemoryTransport {
    fn send(&self, message: TransportMessage) -> Result<(), RpcError> {
        let guard = self.outgoing.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| RpcError::Transport("peer endpoint is closed".to_string())),
            None => Err(RpcError::Transport("transport is closed".to_string())),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_message(&self, stream_id: StreamId, frame: bytes::Bytes) -> Result<(), RpcError> {
        self.send(TransportMessage::payload(stream_id, frame))
    }

    async fn send_metadata(&self, stream_id: StreamId, metadata: Metadata, end_stream: bool) -> Result<(), RpcError> {
        self.send(TransportMessage::metadata(stream_id, metadata, end_stream))
    }

    fn take_incoming(&self) -> Option<BoxStream<'static, TransportMessage>> {
        let rx = self.incoming.lock().unwrap().take()?;
        Some(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.outgoing.lock().unwrap().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multirpc_core::{MessageKind, MetadataFlavor};
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn messages_sent_on_one_end_arrive_on_the_other() {
        let (a, b) = pair();
        let mut b_incoming = b.take_incoming().unwrap();

        a.send_metadata(StreamId(1), Metadata::for_client_initial("/Echo/Say", vec![]), false)
            .await
            .unwrap();

        let msg = b_incoming.next().await.unwrap();
        assert_eq!(msg.stream_id, StreamId(1));
        match msg.kind {
            MessageKind::Metadata(md) => assert_eq!(md.flavor(), MetadataFlavor::InitialRequest),
            MessageKind::Payload(_) => panic!("expected metadata"),
        }
    }

    #[test]
    fn take_incoming_is_single_consumer() {
        let (a, _b) = pair();
        assert!(a.take_incoming().is_some());
        assert!(a.take_incoming().is_none());
    }
}
