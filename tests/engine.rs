//! End-to-end scenarios over a real `TcpListener`/`TcpStream` pair, covering
//! the request lifecycle described across `SPEC_FULL.md` §4: the auth gate,
//! echo dispatch, per-request timeout, and graceful shutdown drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use tenured::auth::{AuthHeader, DefaultAuthChecker};
use tenured::channel::{run_reader, RemotingChannel};
use tenured::command::REQUEST_CODE_AUTH;
use tenured::error::TenuredError;
use tenured::loadbalance::round_robin::RoundRobinLoadBalance;
use tenured::loadbalance::{LoadBalance, Selection};
use tenured::registry::{ServerInstance, Status};
use tenured::server::{CommandHandler, TenuredServer};
use tenured::{TenuredClient, TenuredCommand};

const ECHO_CODE: u16 = 0x1000;
const SLOW_CODE: u16 = 0x1001;

struct EchoHandler;
#[async_trait]
impl CommandHandler for EchoHandler {
    async fn handle(&self, _channel: RemotingChannel, request: TenuredCommand) -> Result<(Vec<u8>, Vec<u8>), TenuredError> {
        Ok((Vec::new(), request.body))
    }
}

/// Never replies within any reasonable per-request timeout, to exercise the
/// client-side timeout path.
struct StallHandler;
#[async_trait]
impl CommandHandler for StallHandler {
    async fn handle(&self, _channel: RemotingChannel, _request: TenuredCommand) -> Result<(Vec<u8>, Vec<u8>), TenuredError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok((Vec::new(), Vec::new()))
    }
}

async fn spawn_server(server: Arc<TenuredServer>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

async fn dial(addr: std::net::SocketAddr) -> Arc<TenuredClient> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let channel = RemotingChannel::new(addr.to_string(), Box::new(write_half));
    let client = TenuredClient::new(channel.clone());
    tokio::spawn(run_reader(channel, read_half, client.clone()));
    client
}

fn test_auth_header() -> AuthHeader {
    AuthHeader { module: "store".to_string(), address: "127.0.0.1:9000".to_string() }
}

async fn authenticate(client: &Arc<TenuredClient>) {
    let auth = TenuredCommand::request(0, REQUEST_CODE_AUTH, b"token".to_vec(), Vec::new());
    let response = client.invoke(auth, Duration::from_secs(1)).await.unwrap();
    assert!(!response.is_error());
}

#[tokio::test]
async fn echo_handler_returns_the_request_body_after_auth() {
    let server = TenuredServer::new(Arc::new(DefaultAuthChecker), test_auth_header(), Duration::from_secs(60));
    server.register(ECHO_CODE, Arc::new(EchoHandler), "default");
    let addr = spawn_server(server).await;

    let client = dial(addr).await;
    authenticate(&client).await;

    let response = client
        .invoke(TenuredCommand::request(0, ECHO_CODE, Vec::new(), b"ping".to_vec()), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.body, b"ping");
}

#[tokio::test]
async fn slow_handler_times_out_without_wedging_the_client() {
    let server = TenuredServer::new(Arc::new(DefaultAuthChecker), test_auth_header(), Duration::from_secs(60));
    server.register(SLOW_CODE, Arc::new(StallHandler), "default");
    server.register(ECHO_CODE, Arc::new(EchoHandler), "default");
    let addr = spawn_server(server).await;

    let client = dial(addr).await;
    authenticate(&client).await;

    let result = client
        .invoke(TenuredCommand::request(0, SLOW_CODE, Vec::new(), Vec::new()), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(TenuredError::Timeout)));

    // The timed-out slot must not poison the table: a fresh call on the same
    // client still round-trips against an unrelated handler.
    let response = client
        .invoke(TenuredCommand::request(0, ECHO_CODE, Vec::new(), b"still alive".to_vec()), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.body, b"still alive");
}

#[tokio::test]
async fn unauthed_request_is_rejected_then_the_channel_is_closed() {
    let server = TenuredServer::new(Arc::new(DefaultAuthChecker), test_auth_header(), Duration::from_secs(60));
    server.register(ECHO_CODE, Arc::new(EchoHandler), "default");
    let addr = spawn_server(server).await;

    let client = dial(addr).await;
    let result = client
        .invoke(TenuredCommand::request(0, ECHO_CODE, Vec::new(), b"ping".to_vec()), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(TenuredError::NotAuthed)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.channel().is_closed());

    let followup = client
        .send_oneway(TenuredCommand::request(0, ECHO_CODE, Vec::new(), Vec::new()), Duration::from_millis(100))
        .await;
    assert!(matches!(followup, Err(TenuredError::Closed)));
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_work_before_returning() {
    let server = TenuredServer::new(Arc::new(DefaultAuthChecker), test_auth_header(), Duration::from_secs(60));
    let done = Arc::new(AtomicBool::new(false));
    let done_for_task = done.clone();
    server
        .executors()
        .get("default")
        .try_submit(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            done_for_task.store(true, Ordering::SeqCst);
        })
        .unwrap();

    server.shutdown().await;
    assert!(done.load(Ordering::SeqCst));

    // Idempotent and rejects further submissions once drained.
    server.shutdown().await;
    assert!(matches!(
        server.executors().get("default").try_submit(async {}),
        Err(TenuredError::Closed)
    ));
}

#[tokio::test]
async fn round_robin_rebalances_after_an_instance_goes_critical() {
    let lb = RoundRobinLoadBalance::new();
    lb.update(vec![
        ServerInstance::new("a", "svc", "h1"),
        ServerInstance::new("b", "svc", "h2"),
        ServerInstance::new("c", "svc", "h3"),
    ]);

    let mut counts = std::collections::HashMap::<String, usize>::new();
    for _ in 0..9 {
        if let Selection::One(instance) = lb.select(0, &[]) {
            *counts.entry(instance.id).or_insert(0) += 1;
        }
    }
    assert_eq!(counts.get("a"), Some(&3));
    assert_eq!(counts.get("b"), Some(&3));
    assert_eq!(counts.get("c"), Some(&3));

    lb.update(vec![
        ServerInstance::new("a", "svc", "h1"),
        ServerInstance::new("b", "svc", "h2").with_status(Status::Critical),
        ServerInstance::new("c", "svc", "h3"),
    ]);

    let mut counts = std::collections::HashMap::<String, usize>::new();
    for _ in 0..6 {
        if let Selection::One(instance) = lb.select(0, &[]) {
            *counts.entry(instance.id).or_insert(0) += 1;
        }
    }
    assert_eq!(counts.get("a"), Some(&3));
    assert_eq!(counts.get("b"), None);
    assert_eq!(counts.get("c"), Some(&3));
}

