//! CommandListener framing, isolation and shutdown over real sockets.

use crate::*;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::json;
use tether_core::message::LocalResponse;
use tether_core::Payload;
use tether_link::listener::{INTERNAL_ERROR, INVALID_MESSAGE};
use tether_link::{CommandHandler, CommandListener, ConnectionWriter, Reply};

/// Echoes `command_details` back inside a `local_response_to_remote`; the
/// `mode` detail selects misbehaviour.
struct ScriptedHandler;

#[async_trait]
impl CommandHandler for ScriptedHandler {
    async fn handle(&self, envelope: &Envelope, _conn: &ConnectionWriter) -> Result<Option<Reply>> {
        match envelope.payload["command_details"]["mode"].as_str() {
            Some("panic") => panic!("handler exploded"),
            Some("fail") => bail!("backend refused"),
            Some("quiet") => Ok(None),
            Some("bogus") => {
                let mut payload = Payload::new();
                payload.insert("echo".into(), envelope.payload["command_details"].clone());
                Ok(Some(Reply::response(payload)))
            }
            _ => {
                let mut data = Payload::new();
                data.insert("echo".into(), envelope.payload["command_details"].clone());
                let response = LocalResponse::success("get_local_status", data);
                Ok(Some(Reply::response(Message::LocalResponse(response).to_payload()?)))
            }
        }
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<Result<()>>,
}

async fn start() -> Running {
    let listener = CommandListener::bind("127.0.0.1:0", Arc::new(ScriptedHandler))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, _) = broadcast::channel(1);
    let task = tokio::spawn(listener.run(shutdown.subscribe()));
    Running { addr, shutdown, task }
}

fn scripted(details: serde_json::Value) -> Envelope {
    command(json!({"command_action": "get_local_status", "command_details": details}))
}

fn echo(n: u64) -> Envelope {
    scripted(json!({"n": n}))
}

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn malformed_line_is_answered_and_connection_stays_open() {
    let server = start().await;
    let mut client = CommandClient::connect(server.addr).await.unwrap();

    client.send_raw(b"this is not json\n").await.unwrap();
    let err = client.recv(WAIT).await.expect("error response");
    assert_eq!(err.kind, MessageKind::ErrorResponse);
    assert_eq!(err.payload["error"], INVALID_MESSAGE);

    let req = echo(1);
    client.send(&req).await.unwrap();
    let reply = client.recv(WAIT).await.expect("reply after bad line");
    assert_eq!(reply.kind, MessageKind::LocalResponseToRemote);
    assert_eq!(reply.correlation_id, req.correlation_id);
    assert_eq!(reply.payload["data"]["echo"]["n"], 1);
}

#[tokio::test]
async fn invalid_envelope_keeps_its_correlation_id() {
    let server = start().await;
    let mut client = CommandClient::connect(server.addr).await.unwrap();

    client
        .send_raw(br#"{"task_id":"abc-123","message_type":"no_such_kind","payload":{}}"#)
        .await
        .unwrap();
    client.send_raw(b"\n").await.unwrap();
    let err = client.recv(WAIT).await.unwrap();
    assert_eq!(err.kind, MessageKind::ErrorResponse);
    assert_eq!(err.correlation_id, "abc-123");
}

#[tokio::test]
async fn frames_split_and_coalesced_across_writes() {
    let server = start().await;
    let mut client = CommandClient::connect(server.addr).await.unwrap();

    let first = echo(1);
    let frame = encode_frame(&first).unwrap();
    let (a, rest) = frame.split_at(5);
    let (b, c) = rest.split_at(rest.len() / 2);
    for chunk in [a, b, c] {
        client.send_raw(chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.recv(WAIT).await.unwrap().correlation_id, first.correlation_id);

    let (second, third) = (echo(2), echo(3));
    let mut both = encode_frame(&second).unwrap().to_vec();
    both.extend_from_slice(b"\r\n\n");
    both.extend_from_slice(&encode_frame(&third).unwrap());
    client.send_raw(&both).await.unwrap();
    assert_eq!(client.recv(WAIT).await.unwrap().correlation_id, second.correlation_id);
    assert_eq!(client.recv(WAIT).await.unwrap().correlation_id, third.correlation_id);
}

#[tokio::test]
async fn concurrent_connections_are_independent() {
    let server = start().await;

    let mut clients = Vec::new();
    for n in 0..5u64 {
        let addr = server.addr;
        clients.push(tokio::spawn(async move {
            let mut client = CommandClient::connect(addr).await.unwrap();
            let req = echo(n);
            client.send(&req).await.unwrap();
            let reply = client.recv(WAIT).await.unwrap();
            (req.correlation_id, reply)
        }));
    }
    for (n, handle) in clients.into_iter().enumerate() {
        let (id, reply) = handle.await.unwrap();
        assert_eq!(reply.correlation_id, id);
        assert_eq!(reply.payload["data"]["echo"]["n"], n as u64);
    }
}

#[tokio::test]
async fn handler_failure_and_panic_become_error_responses() {
    let server = start().await;
    let mut client = CommandClient::connect(server.addr).await.unwrap();

    let boom = scripted(json!({"mode": "panic"}));
    client.send(&boom).await.unwrap();
    let err = client.recv(WAIT).await.expect("panic answered");
    assert_eq!(err.kind, MessageKind::ErrorResponse);
    assert_eq!(err.correlation_id, boom.correlation_id);
    assert_eq!(err.payload["error"], INTERNAL_ERROR);
    assert!(err.payload["details"].as_str().unwrap().contains("handler exploded"));

    let fail = scripted(json!({"mode": "fail"}));
    client.send(&fail).await.unwrap();
    let err = client.recv(WAIT).await.unwrap();
    assert_eq!(err.correlation_id, fail.correlation_id);
    assert!(err.payload["details"].as_str().unwrap().contains("backend refused"));

    // Same connection, still serving.
    let req = echo(9);
    client.send(&req).await.unwrap();
    assert_eq!(client.recv(WAIT).await.unwrap().correlation_id, req.correlation_id);
}

#[tokio::test]
async fn reply_breaking_its_schema_is_replaced_by_error() {
    let server = start().await;
    let mut client = CommandClient::connect(server.addr).await.unwrap();

    let bogus = scripted(json!({"mode": "bogus"}));
    client.send(&bogus).await.unwrap();
    let err = client.recv(WAIT).await.expect("bogus reply answered");
    assert_eq!(err.kind, MessageKind::ErrorResponse);
    assert_eq!(err.correlation_id, bogus.correlation_id);
    assert_eq!(err.payload["error"], INTERNAL_ERROR);

    let req = echo(5);
    client.send(&req).await.unwrap();
    let reply = client.recv(WAIT).await.unwrap();
    assert_eq!(reply.correlation_id, req.correlation_id);
    assert_eq!(reply.payload["status"], "success");
}

#[tokio::test]
async fn unanswered_envelope_sends_nothing() {
    let server = start().await;
    let mut client = CommandClient::connect(server.addr).await.unwrap();

    client.send(&scripted(json!({"mode": "quiet"}))).await.unwrap();
    let req = echo(4);
    client.send(&req).await.unwrap();
    // The first reply on the wire belongs to the second envelope.
    assert_eq!(client.recv(WAIT).await.unwrap().correlation_id, req.correlation_id);
}

#[tokio::test]
async fn shutdown_closes_open_connections() {
    let server = start().await;
    let mut client = CommandClient::connect(server.addr).await.unwrap();
    client.send(&echo(1)).await.unwrap();
    assert!(client.recv(WAIT).await.is_some());

    server.shutdown.send(()).unwrap();
    let result = tokio::time::timeout(WAIT, server.task)
        .await
        .expect("listener stopped")
        .unwrap();
    assert!(result.is_ok());
    assert!(client.recv(WAIT).await.is_none(), "connection closed by server");
}
