//! End-to-end scenarios over a real client/server pair wired together by
//! an in-memory transport (spec §8's literal-value scenarios S1-S8).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use multirpc_codec_json::JsonCodec;
use multirpc_core::error::RpcError;
use multirpc_core::logging::Logger;
use multirpc_core::patterns::bidi::BidiHandler;
use multirpc_core::patterns::client_stream::ClientStreamHandler;
use multirpc_core::patterns::server_stream::ServerStreamHandler;
use multirpc_core::patterns::unary::UnaryHandler;
use multirpc_core::status::Code;
use multirpc_core::{Dispatcher, DispatcherOptions};

fn wire_pair() -> (Arc<Dispatcher>, Arc<Dispatcher>) {
    let (a, b) = multirpc_transport_memory::pair();
    let client = Dispatcher::new(a, Logger::default(), DispatcherOptions::default());
    let server = Dispatcher::new(b, Logger::default(), DispatcherOptions::default());
    server.run();
    client.run();
    (client, server)
}

struct Echo;
#[async_trait]
impl UnaryHandler<String, String> for Echo {
    async fn handle(&self, request: String) -> Result<String, String> {
        Ok(format!("echo:{request}"))
    }
}

struct Fail;
#[async_trait]
impl UnaryHandler<String, String> for Fail {
    async fn handle(&self, _request: String) -> Result<String, String> {
        Err("boom".to_string())
    }
}

struct SleepyEcho;
#[async_trait]
impl UnaryHandler<String, String> for SleepyEcho {
    async fn handle(&self, request: String) -> Result<String, String> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(request)
    }
}

#[tokio::test]
async fn s1_unary_echo() {
    let (client, server) = wire_pair();
    server
        .register_unary("/EchoService/Echo", JsonCodec::<String>::new(), JsonCodec::<String>::new(), Echo)
        .unwrap();

    let response = client
        .call_unary(
            "/EchoService/Echo",
            vec![],
            &JsonCodec::<String>::new(),
            &JsonCodec::<String>::new(),
            "hello".to_string(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(response, "echo:hello");
}

#[tokio::test]
async fn s2_unary_handler_failure() {
    let (client, server) = wire_pair();
    server
        .register_unary("/EchoService/Fail", JsonCodec::<String>::new(), JsonCodec::<String>::new(), Fail)
        .unwrap();

    let err = client
        .call_unary(
            "/EchoService/Fail",
            vec![],
            &JsonCodec::<String>::new(),
            &JsonCodec::<String>::new(),
            "anything".to_string(),
            None,
        )
        .await
        .unwrap_err();

    match err {
        RpcError::Status { status } => {
            assert_eq!(status.code, Code::INTERNAL);
            assert!(status.message.contains("boom"));
        }
        other => panic!("expected Status error, got {other:?}"),
    }
}

struct GenerateNumbers;
#[async_trait]
impl ServerStreamHandler<String, String> for GenerateNumbers {
    async fn handle(&self, request: String, responses: tokio::sync::mpsc::Sender<String>) -> Result<(), String> {
        let n: u32 = request.parse().map_err(|_| "not a number".to_string())?;
        for i in 1..=n {
            if responses.send(format!("Number {i}")).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn s3_server_streaming_count() {
    let (client, server) = wire_pair();
    server
        .register_server_stream(
            "/NumberService/GenerateNumbers",
            JsonCodec::<String>::new(),
            JsonCodec::<String>::new(),
            GenerateNumbers,
        )
        .unwrap();

    let req_codec = JsonCodec::<String>::new();
    let resp_codec = JsonCodec::<String>::new();
    let mut call = client
        .open_server_stream("/NumberService/GenerateNumbers", vec![])
        .await
        .unwrap();
    call.send_request(&req_codec, &"3".to_string()).await.unwrap();

    let mut received = Vec::new();
    while let Some(item) = call.recv::<String, _>(&resp_codec).await.unwrap() {
        received.push(item);
    }

    assert_eq!(received, vec!["Number 1", "Number 2", "Number 3"]);
}

struct Aggregate;
#[async_trait]
impl ClientStreamHandler<String, String> for Aggregate {
    async fn handle(&self, mut requests: ReceiverStream<String>) -> Result<String, String> {
        let mut parts = Vec::new();
        while let Some(item) = requests.next().await {
            parts.push(item);
        }
        Ok(format!("Aggregated: {}", parts.join(", ")))
    }
}

#[tokio::test]
async fn s4_client_streaming_aggregate() {
    let (client, server) = wire_pair();
    server
        .register_client_stream(
            "/AggregatorService/Aggregate",
            JsonCodec::<String>::new(),
            JsonCodec::<String>::new(),
            Aggregate,
        )
        .unwrap();

    let req_codec = JsonCodec::<String>::new();
    let resp_codec = JsonCodec::<String>::new();
    let call = client
        .open_client_stream::<String>("/AggregatorService/Aggregate", vec![])
        .await
        .unwrap();

    call.send(&req_codec, &"Part1".to_string()).await.unwrap();
    call.send(&req_codec, &"Part2".to_string()).await.unwrap();
    call.send(&req_codec, &"Part3".to_string()).await.unwrap();

    let response = call.finish(&resp_codec).await.unwrap();
    assert_eq!(response, "Aggregated: Part1, Part2, Part3");
}

struct Chat;
#[async_trait]
impl BidiHandler<String, String> for Chat {
    async fn handle(
        &self,
        mut requests: ReceiverStream<String>,
        responses: tokio::sync::mpsc::Sender<String>,
    ) -> Result<(), String> {
        while let Some(item) = requests.next().await {
            let reply = if item.starts_with("ping") {
                "pong".to_string()
            } else {
                format!("echo: {item}")
            };
            if responses.send(reply).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn s5_bidirectional_ping_pong() {
    let (client, server) = wire_pair();
    server
        .register_bidi("/ChatService/Chat", JsonCodec::<String>::new(), JsonCodec::<String>::new(), Chat)
        .unwrap();

    let req_codec = JsonCodec::<String>::new();
    let resp_codec = JsonCodec::<String>::new();
    let mut call = client.open_bidi("/ChatService/Chat", vec![]).await.unwrap();

    call.send(&req_codec, &"ping 1".to_string()).await.unwrap();
    call.send(&req_codec, &"hello".to_string()).await.unwrap();
    call.send(&req_codec, &"ping 2".to_string()).await.unwrap();
    call.finish_sending().await.unwrap();

    let mut received = Vec::new();
    while let Some(item) = call.recv::<String, _>(&resp_codec).await.unwrap() {
        received.push(item);
    }

    assert_eq!(received, vec!["pong", "echo: hello", "pong"]);
}

#[tokio::test]
async fn s6_unknown_method() {
    let (client, _server) = wire_pair();

    let err = client
        .call_unary(
            "/Unknown/Nope",
            vec![],
            &JsonCodec::<String>::new(),
            &JsonCodec::<String>::new(),
            "x".to_string(),
            None,
        )
        .await
        .unwrap_err();

    match err {
        RpcError::Status { status } => {
            assert_eq!(status.code, Code::UNIMPLEMENTED);
            assert_eq!(status.message, "method not found");
        }
        other => panic!("expected Status error, got {other:?}"),
    }
}

#[tokio::test]
async fn s7_timeout() {
    let (client, server) = wire_pair();
    server
        .register_unary("/SlowService/Sleep", JsonCodec::<String>::new(), JsonCodec::<String>::new(), SleepyEcho)
        .unwrap();

    let err = client
        .call_unary(
            "/SlowService/Sleep",
            vec![],
            &JsonCodec::<String>::new(),
            &JsonCodec::<String>::new(),
            "x".to_string(),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Timeout));
}

#[tokio::test]
async fn handler_failure_does_not_break_subsequent_calls_on_a_different_stream() {
    // Invariant 7: a handler exception never terminates the dispatcher.
    let (client, server) = wire_pair();
    server
        .register_unary("/EchoService/Fail", JsonCodec::<String>::new(), JsonCodec::<String>::new(), Fail)
        .unwrap();
    server
        .register_unary("/EchoService/Echo", JsonCodec::<String>::new(), JsonCodec::<String>::new(), Echo)
        .unwrap();

    let _ = client
        .call_unary(
            "/EchoService/Fail",
            vec![],
            &JsonCodec::<String>::new(),
            &JsonCodec::<String>::new(),
            "x".to_string(),
            None,
        )
        .await;

    let response = client
        .call_unary(
            "/EchoService/Echo",
            vec![],
            &JsonCodec::<String>::new(),
            &JsonCodec::<String>::new(),
            "still alive".to_string(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(response, "echo:still alive");
}

#[tokio::test]
async fn duplicate_path_registration_fails_at_setup_time() {
    let (_client, server) = wire_pair();
    server
        .register_unary("/EchoService/Echo", JsonCodec::<String>::new(), JsonCodec::<String>::new(), Echo)
        .unwrap();

    let result = server.register_unary(
        "/EchoService/Echo",
        JsonCodec::<String>::new(),
        JsonCodec::<String>::new(),
        Echo,
    );

    assert!(result.is_err());
}
