//! 接続ゲートウェイ
//!
//! `/transcribe` のアップグレードから1接続分の状態機械
//! （未認証 → 入場審査 → 準備完了 → クローズ）までを担う。
//! 送信は接続ごとの単一ライタータスクに集約し、クローズフレームを
//! 最後の1枚として書く。
mod error;

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, StaticTokenResolver, TokenResolver, UserId};
use crate::config::GatewayConfig;
use crate::protocol::{decode_frame, CloseReason, ServerMessage};
use crate::session::{Outbound, SessionHandle, SessionRegistry, WorkItem};
use crate::transcriber::{SimulatedTranscriber, Transcriber};
use crate::usage::{InMemoryUsageStore, UsageRecord, UsageStore};

pub use error::ApiError;

/// ルーターとディスパッチャが共有するアプリケーション状態
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub resolver: Arc<dyn TokenResolver>,
    pub usage: Arc<dyn UsageStore>,
    pub transcriber: Arc<dyn Transcriber>,
    pub registry: Arc<SessionRegistry>,
    pub wake: Arc<Notify>,
    pub shutdown: CancellationToken,
}

impl GatewayState {
    /// 設定から既定のコラボレータ一式を組み立てる
    pub fn new(config: Arc<GatewayConfig>, shutdown: CancellationToken) -> Self {
        let users = config.known_users().into_iter().map(UserId::new);
        Self {
            resolver: Arc::new(StaticTokenResolver::new(config.auth.tokens.clone())),
            usage: Arc::new(InMemoryUsageStore::new(users, config.usage.initial_budget_ms)),
            transcriber: Arc::new(SimulatedTranscriber::new(&config.transcriber)),
            registry: Arc::new(SessionRegistry::new()),
            wake: Arc::new(Notify::new()),
            shutdown,
            config,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn TokenResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_usage_store(mut self, usage: Arc<dyn UsageStore>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = transcriber;
        self
    }
}

pub fn create_app(state: GatewayState) -> Router {
    Router::new()
        .route("/transcribe", get(upgrade_transcribe))
        .route("/api/usage", get(get_api_usage))
        .route("/health", get(health_check))
        .with_state(state)
}

async fn upgrade_transcribe(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    // 認証失敗でもアップグレード自体は完了させ、クローズフレームで通知する
    ws.on_upgrade(move |socket| async move {
        let auth = state.resolver.resolve(authorization.as_deref()).await;
        handle_socket(state, socket, auth).await;
    })
}

async fn get_api_usage(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Json<UsageRecord>, ApiError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let user = state.resolver.resolve(authorization).await?;
    let record = state.usage.get_usage(&user).await?;
    Ok(Json(record))
}

async fn health_check(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "activeSessions": state.registry.active_sessions().await,
    }))
}

async fn handle_socket(state: GatewayState, socket: WebSocket, auth: Result<UserId, AuthError>) {
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_outbound(sink, outbound_rx));

    match auth {
        Ok(user_id) => {
            let session = Arc::new(SessionHandle::new(user_id, outbound_tx));
            if let Some(evicted) = state.registry.register(session.clone()).await {
                info!(user_id = %session.user_id(), "evicting the previous session");
                evicted.close(CloseReason::connection_replaced());
            }
            info!(user_id = %session.user_id(), "session registered");

            run_session(&state, &session, stream).await;

            state.registry.unregister(&session).await;
            session.abandon();
            info!(user_id = %session.user_id(), "session finished");
        }
        Err(err) => {
            debug!(error = %err, "websocket authentication failed");
            let _ = outbound_tx.send(Outbound::Close(CloseReason::unauthorized()));
            drop(outbound_tx);
        }
    }

    let _ = writer.await;
}

/// 受信ループ。入場審査は同じselectの中で競走させるため、審査より先に
/// 届いたフレームは NotReady で弾ける。
async fn run_session(
    state: &GatewayState,
    session: &Arc<SessionHandle>,
    mut stream: SplitStream<WebSocket>,
) {
    let usage = state.usage.clone();
    let admission_user = session.user_id().clone();
    let admission = async move { usage.get_usage(&admission_user).await };
    tokio::pin!(admission);
    let mut admitted = false;

    loop {
        tokio::select! {
            _ = session.closed() => break,
            result = &mut admission, if !admitted => {
                admitted = true;
                match result {
                    Ok(record) if record.remaining_ms > 0 => {
                        session.mark_ready();
                        session.send(ServerMessage::ready());
                        info!(
                            user_id = %session.user_id(),
                            remaining_ms = record.remaining_ms,
                            "session ready"
                        );
                    }
                    Ok(_) => {
                        info!(user_id = %session.user_id(), "admission rejected, budget exhausted");
                        session.close(CloseReason::exceeded_allocated_usage());
                        break;
                    }
                    Err(err) => {
                        warn!(
                            user_id = %session.user_id(),
                            error = %err,
                            "usage lookup failed during admission"
                        );
                        session.close(CloseReason::server_error(err.to_string()));
                        break;
                    }
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        if !session.is_ready() {
                            session.close(CloseReason::not_ready());
                            break;
                        }
                        match decode_frame(data) {
                            Ok(frame) => {
                                debug!(
                                    user_id = %session.user_id(),
                                    sequence_id = frame.sequence_id,
                                    bytes = frame.payload.len(),
                                    "frame enqueued"
                                );
                                session
                                    .queue()
                                    .enqueue(WorkItem::new(frame.sequence_id, frame.payload));
                                state.wake.notify_one();
                            }
                            Err(err) => {
                                debug!(user_id = %session.user_id(), error = %err, "invalid inbound frame");
                                session.close(CloseReason::invalid_data());
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        if !session.is_ready() {
                            session.close(CloseReason::not_ready());
                            break;
                        }
                        // 準備完了後のテキストフレームは読み捨てる
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(user_id = %session.user_id(), "peer closed the connection");
                        session.abandon();
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong は下層が処理する
                    Some(Err(err)) => {
                        debug!(user_id = %session.user_id(), error = %err, "socket error");
                        session.abandon();
                        break;
                    }
                }
            }
        }
    }
}

/// 接続ごとの単一ライター。クローズフレームを書いたら必ず終了する。
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Message(json) => {
                if sink.send(Message::Text(Utf8Bytes::from(json))).await.is_err() {
                    break;
                }
            }
            Outbound::Close(reason) => {
                let frame = CloseFrame {
                    code: reason.ws_code(),
                    reason: Utf8Bytes::from(reason.to_reason_json()),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}
