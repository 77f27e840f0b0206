//! dongled - streams realtime events about attached modem dongles
//!
//! Main entry point: CLI parsing, logging, and component wiring.

use clap::{Parser, Subcommand};
use dongled::event_hub::EventHub;
use dongled::hotplug::UdevSource;
use dongled::probe::{ProbeConfig, SerialProber};
use dongled::reconciler::Reconciler;
use dongled::state::{AppConfig, AppState};
use dongled::store::DongleStore;
use dongled::symlink::SymlinkManager;
use dongled::web_api;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dongled")]
#[command(about = "Streams realtime events about devices (dongles)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a server that listens to udev events
    #[command(alias = "s")]
    Server {
        /// Port to bind the server
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dongled=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server { port } => serve(port).await,
    }
}

async fn serve(port: Option<u16>) -> anyhow::Result<()> {
    tracing::info!("Starting dongled v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::default();
    if let Some(port) = port {
        config.port = port;
    }
    tracing::info!(
        database_url = %config.database_url,
        dev_dir = %config.dev_dir.display(),
        "Configuration loaded"
    );

    let store = DongleStore::connect(&config.database_url).await?;
    tracing::info!("Store ready");

    let events = Arc::new(EventHub::new());
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        events.clone(),
        SymlinkManager::new(&config.dev_dir),
        Arc::new(SerialProber::new(ProbeConfig::default())),
        config.dev_dir.clone(),
    ));

    let source = UdevSource::new();
    let cancel = CancellationToken::new();

    // Purge stale aliases and reconcile whatever is already attached before
    // accepting live events or subscribers.
    reconciler.startup(&source).await?;
    tracing::info!("startup reconciliation complete, ready for hotplug events");

    let manager = {
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler.run(&source, cancel).await {
                tracing::error!(error = %e, "device manager exited with error");
            }
        })
    };

    let state = AppState {
        config: config.clone(),
        store,
        events,
    };
    let app = web_api::create_router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    let _ = manager.await;
    tracing::info!("dongled stopped");
    Ok(())
}
