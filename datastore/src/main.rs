use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rslive_shared::DatastoreConfig;

use rslive_datastore::service::DataService;
use rslive_datastore::summarize::{GeminiSummarizer, Summarizer};
use rslive_datastore::{db, migrations, server};

#[derive(Parser, Debug, Clone)]
#[command(name = "rslive-datastore")]
#[command(about = "rslive datastore service")]
struct Args {
    /// Apply schema migrations and exit without serving
    #[arg(long)]
    migrate_only: bool,
}

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
    let config = DatastoreConfig::from_env()?;

    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = db::create_pool(&db_path, &config.encryption_key)?;

    tracing::info!("Running schema migrations...");
    {
        let mut conn = pool.get()?;
        for (name, status) in migrations::run_all(&mut conn)? {
            tracing::info!("{name}: {status}");
        }
    }
    if args.migrate_only {
        return Ok(());
    }

    let summarizer: Option<Arc<dyn Summarizer>> = match config.gemini_api_key {
        Some(key) => {
            tracing::info!("Conversation summarizer enabled");
            Some(Arc::new(GeminiSummarizer::new(key)))
        }
        None => {
            tracing::info!("GEMINI_API_KEY not set, summarizer disabled");
            None
        }
    };

    let service = Arc::new(DataService::new(pool, summarizer));
    let ipc = server::IpcServer::bind(&config.socket_path, service)?;
    tracing::info!("Listening on {}", config.socket_path.display());

    tokio::select! {
        result = ipc.run() => result?,
        _ = shutdown_signal() => {
            tracing::info!("Shutdown complete");
        }
    }

    // Leave no stale socket behind for the next start.
    let _ = std::fs::remove_file(&config.socket_path);
    Ok(())
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
