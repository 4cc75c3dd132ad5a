mod accept;
mod checkpoint;
mod ipc;
mod orchestrator;
mod upstream;
mod usage;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rslive_shared::GatewayConfig;

use crate::ipc::IpcClient;

#[derive(Parser, Debug, Clone)]
#[command(name = "rslive-gateway")]
#[command(about = "rslive realtime gateway")]
struct Args {
    /// Address to bind the client listener on
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,
}

pub struct AppState {
    pub ipc: IpcClient,
    pub upstream_url: String,
    pub openai_api_key: String,
}

const IPC_CONNECT_ATTEMPTS: u32 = 5;
const IPC_CONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = GatewayConfig::from_env()?;

    let ipc = connect_ipc(&config).await?;
    let state = Arc::new(AppState {
        ipc,
        upstream_url: config.upstream_url,
        openai_api_key: config.openai_api_key,
    });

    let app = Router::new()
        .route("/api/health", get(|| async { "OK" }))
        .route("/v1/realtime", get(accept::handle_realtime))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.ipc.destroy();
    tracing::info!("Shutdown complete");
    Ok(())
}

/// The datastore usually comes up alongside us; retry a few times before
/// giving up. A transport that dies later surfaces as 503 on new sessions.
async fn connect_ipc(config: &GatewayConfig) -> anyhow::Result<IpcClient> {
    let mut last_error = None;
    for attempt in 1..=IPC_CONNECT_ATTEMPTS {
        match IpcClient::connect(&config.socket_path, config.request_timeout).await {
            Ok(client) => {
                tracing::info!("Connected to datastore at {}", config.socket_path.display());
                return Ok(client);
            }
            Err(e) => {
                tracing::warn!("IPC connect attempt {attempt}/{IPC_CONNECT_ATTEMPTS} failed: {e}");
                last_error = Some(e);
                tokio::time::sleep(IPC_CONNECT_BACKOFF).await;
            }
        }
    }
    Err(last_error.expect("at least one attempt"))
}

/// Handle shutdown signals (SIGTERM, SIGINT) gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        },
    }
}
