use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use transcribe_gateway::config::GatewayConfig;
use transcribe_gateway::gateway::GatewayState;
use transcribe_gateway::protocol::encode_frame;
use transcribe_gateway::server::run_with_listener;
use transcribe_gateway::transcriber::{Transcriber, TranscriberError, Transcription};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn many_user_config(users: usize) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.tokens = (0..users)
        .map(|i| (format!("t{i}"), format!("u{i}")))
        .collect::<HashMap<_, _>>();
    config.usage.initial_budget_ms = 10_000;
    config
}

async fn spawn_gateway(state: GatewayState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = run_with_listener(listener, state).await;
    });
    addr
}

async fn connect(addr: SocketAddr, token: &str) -> ClientSocket {
    let mut request = format!("ws://{addr}/transcribe")
        .into_client_request()
        .expect("client request");
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {token}").parse().expect("header value"),
    );
    let (socket, _response) = connect_async(request).await.expect("connect");
    socket
}

async fn next_message(socket: &mut ClientSocket) -> Message {
    tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended unexpectedly")
        .expect("socket error")
}

async fn expect_ready(socket: &mut ClientSocket) {
    match next_message(socket).await {
        Message::Text(text) => assert_eq!(text.as_str(), r#"{"event":"ready"}"#),
        other => panic!("expected the ready event, got {other:?}"),
    }
}

async fn expect_close(socket: &mut ClientSocket, ws_code: u16, reason_code: u64) {
    loop {
        match next_message(socket).await {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), ws_code, "unexpected close code");
                let reason: serde_json::Value =
                    serde_json::from_str(frame.reason.as_str()).expect("reason json");
                assert_eq!(reason["code"].as_u64(), Some(reason_code));
                return;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}

struct CountingTranscriber {
    concurrent: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl Transcriber for CountingTranscriber {
    async fn transcribe(
        &self,
        payload: &[u8],
        _cancel: CancellationToken,
    ) -> Result<Transcription, TranscriberError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(Transcription {
            transcript: format!("{} bytes", payload.len()),
            confidence: 0.9,
            usage_used_ms: 10,
        })
    }
}

#[tokio::test]
async fn in_flight_tasks_never_exceed_the_global_cap() {
    let shutdown = CancellationToken::new();
    let transcriber = Arc::new(CountingTranscriber {
        concurrent: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        delay: Duration::from_millis(80),
    });
    let state = GatewayState::new(Arc::new(many_user_config(8)), shutdown.clone())
        .with_transcriber(transcriber.clone());
    let addr = spawn_gateway(state).await;

    let mut sockets = Vec::new();
    for i in 0..8 {
        let mut socket = connect(addr, &format!("t{i}")).await;
        expect_ready(&mut socket).await;
        socket
            .send(Message::Binary(encode_frame(1, b"payload")))
            .await
            .expect("send frame");
        sockets.push(socket);
    }

    for socket in &mut sockets {
        match next_message(socket).await {
            Message::Text(text) => {
                let reply: serde_json::Value =
                    serde_json::from_str(text.as_str()).expect("json reply");
                assert_eq!(reply["id"], 1);
            }
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    let peak = transcriber.peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "global cap exceeded: {peak} tasks in flight");
    assert!(peak >= 2, "expected some parallelism across users, saw {peak}");

    shutdown.cancel();
}

/// 呼び出しごとのキャンセルトークンを控えておき、後から観測できるようにする
struct ProbeTranscriber {
    started: Arc<Notify>,
    tokens: parking_lot::Mutex<Vec<CancellationToken>>,
}

#[async_trait]
impl Transcriber for ProbeTranscriber {
    async fn transcribe(
        &self,
        _payload: &[u8],
        cancel: CancellationToken,
    ) -> Result<Transcription, TranscriberError> {
        self.tokens.lock().push(cancel.clone());
        self.started.notify_one();
        cancel.cancelled().await;
        Err(TranscriberError::Cancelled)
    }
}

#[tokio::test]
async fn disconnect_cancels_the_in_flight_task() {
    let shutdown = CancellationToken::new();
    let started = Arc::new(Notify::new());
    let transcriber = Arc::new(ProbeTranscriber {
        started: started.clone(),
        tokens: parking_lot::Mutex::new(Vec::new()),
    });
    let state = GatewayState::new(Arc::new(GatewayConfig::default()), shutdown.clone())
        .with_transcriber(transcriber.clone());
    let addr = spawn_gateway(state).await;

    let mut socket = connect(addr, "a").await;
    expect_ready(&mut socket).await;
    socket
        .send(Message::Binary(encode_frame(1, b"payload")))
        .await
        .expect("send frame");

    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("transcription starts");

    socket.close(None).await.expect("client close");

    let token = transcriber.tokens.lock()[0].clone();
    tokio::time::timeout(Duration::from_secs(2), token.cancelled())
        .await
        .expect("in-flight task is cancelled on disconnect");

    shutdown.cancel();
}

/// 即座に中断済みを報告するエンジン（上流側の中断を模す）
struct AbortingTranscriber;

#[async_trait]
impl Transcriber for AbortingTranscriber {
    async fn transcribe(
        &self,
        _payload: &[u8],
        _cancel: CancellationToken,
    ) -> Result<Transcription, TranscriberError> {
        Err(TranscriberError::Cancelled)
    }
}

#[tokio::test]
async fn upstream_abort_closes_with_going_away() {
    let shutdown = CancellationToken::new();
    let state = GatewayState::new(Arc::new(GatewayConfig::default()), shutdown.clone())
        .with_transcriber(Arc::new(AbortingTranscriber));
    let addr = spawn_gateway(state).await;

    let mut socket = connect(addr, "a").await;
    expect_ready(&mut socket).await;
    socket
        .send(Message::Binary(encode_frame(1, b"payload")))
        .await
        .expect("send frame");

    expect_close(&mut socket, 1001, 2).await;
    shutdown.cancel();
}

struct FailingTranscriber;

#[async_trait]
impl Transcriber for FailingTranscriber {
    async fn transcribe(
        &self,
        _payload: &[u8],
        _cancel: CancellationToken,
    ) -> Result<Transcription, TranscriberError> {
        Err(TranscriberError::engine("model exploded"))
    }
}

#[tokio::test]
async fn engine_failure_closes_with_server_error() {
    let shutdown = CancellationToken::new();
    let state = GatewayState::new(Arc::new(GatewayConfig::default()), shutdown.clone())
        .with_transcriber(Arc::new(FailingTranscriber));
    let addr = spawn_gateway(state).await;

    let mut socket = connect(addr, "a").await;
    expect_ready(&mut socket).await;
    socket
        .send(Message::Binary(encode_frame(1, b"payload")))
        .await
        .expect("send frame");

    expect_close(&mut socket, 1011, 99).await;
    shutdown.cancel();
}

struct StallingTranscriber;

#[async_trait]
impl Transcriber for StallingTranscriber {
    async fn transcribe(
        &self,
        _payload: &[u8],
        cancel: CancellationToken,
    ) -> Result<Transcription, TranscriberError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TranscriberError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(600)) => {
                Err(TranscriberError::engine("unreachable"))
            }
        }
    }
}

#[tokio::test]
async fn deadline_expiry_closes_with_the_timeout_code() {
    let shutdown = CancellationToken::new();
    let mut config = GatewayConfig::default();
    config.dispatch.task_timeout_ms = 100;
    let state = GatewayState::new(Arc::new(config), shutdown.clone())
        .with_transcriber(Arc::new(StallingTranscriber));
    let addr = spawn_gateway(state).await;

    let mut socket = connect(addr, "a").await;
    expect_ready(&mut socket).await;
    socket
        .send(Message::Binary(encode_frame(1, b"payload")))
        .await
        .expect("send frame");

    expect_close(&mut socket, 3008, 1).await;
    shutdown.cancel();
}
