//! サーバ起動とシャットダウンの順序制御
//!
//! `run_with_listener` はテストからも使う起動口。シャットダウン通知で
//! 受け付けを止め、全セッションへ GoingAway を送り、ディスパッチャの
//! 排水を待ってから戻る。
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use crate::dispatch::Dispatcher;
use crate::gateway::{create_app, GatewayState};
use crate::protocol::CloseReason;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(std::io::Error),
    #[error("serve error: {0}")]
    Serve(std::io::Error),
}

/// 設定のポートにバインドしてゲートウェイを起動
pub async fn bind_and_run(state: GatewayState) -> Result<(), ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.server.port));
    let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
    run_with_listener(listener, state).await
}

/// 既存の `TcpListener` でゲートウェイを起動(テストでも使用)
pub async fn run_with_listener(
    listener: TcpListener,
    state: GatewayState,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "transcription gateway listening");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        state.registry.clone(),
        state.usage.clone(),
        state.transcriber.clone(),
        state.wake.clone(),
        state.shutdown.clone(),
        &state.config.dispatch,
    ));
    let dispatcher_task = tokio::spawn(dispatcher.run());

    // シャットダウン通知で全セッションを畳む。接続ハンドラが終わらないと
    // graceful shutdown も完了しないため、serve と並行して行う。
    let drain_state = state.clone();
    let drain_task = tokio::spawn(async move {
        drain_state.shutdown.cancelled().await;
        let sessions = drain_state.registry.drain().await;
        info!(sessions = sessions.len(), "closing live sessions for shutdown");
        for session in sessions {
            session.close(CloseReason::shutting_down());
        }
    });

    let serve_shutdown = state.shutdown.clone();
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await
        .map_err(ServerError::Serve)?;

    let _ = drain_task.await;
    let _ = dispatcher_task.await;
    info!("transcription gateway stopped");
    Ok(())
}
