use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use transcribe_gateway::config::GatewayConfig;
use transcribe_gateway::gateway::GatewayState;
use transcribe_gateway::server;

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match GatewayConfig::load_from_env() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(error = ?err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        port = config.server.port,
        users = config.known_users().len(),
        "configuration loaded"
    );

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let state = GatewayState::new(config, shutdown);
    if let Err(err) = server::bind_and_run(state).await {
        error!(error = %err, "gateway terminated abnormally");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .finish();

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
