//! tagrank-api - HTTP service for tag prominence and ranking
//!
//! Serves work ingest, author overrides, per-work reads, search and
//! migration batch control. When `publish.endpoint` is configured a
//! background publisher drains score updates to the search index.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tagrank_common::config::TomlConfig;
use tagrank_common::db::init_database;
use tagrank_common::events::EventBus;
use tagrank_engine::{HttpSearchIndex, Publisher, TagEngine};
use tagrank_api::{build_router, AppState};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for tagrank-api
#[derive(Parser, Debug)]
#[command(name = "tagrank-api")]
#[command(about = "Tag prominence classification and ranking service")]
#[command(version)]
struct Args {
    /// Config file (overrides TAGRANK_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file (overrides TAGRANK_DATABASE)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Port to listen on (overrides server.port)
    #[arg(short, long, env = "TAGRANK_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TomlConfig::resolve(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},tower_http=info", config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting tagrank-api v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("TAGRANK_GIT_HASH"),
        env!("TAGRANK_BUILT_AT"),
        env!("TAGRANK_PROFILE")
    );

    let db_path = config.resolve_database_path(args.database.as_deref());
    info!("Database path: {}", db_path.display());
    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let host = config.server.host.clone();
    let port = args.port.unwrap_or(config.server.port);
    let config = Arc::new(config);

    let events = EventBus::default();
    let engine = TagEngine::new(pool.clone(), config.clone(), events.clone());
    let state = AppState::new(engine);
    let shutdown = state.shutdown.clone();

    let publisher_task = match config.publish.endpoint.as_deref() {
        Some(endpoint) => {
            let index = HttpSearchIndex::new(endpoint, config.publish.request_timeout_ms)
                .context("Failed to build search index client")?;
            let publisher = Publisher::new(pool, Arc::new(index), config.publish.clone(), events);
            let cancel = shutdown.child_token();
            info!(endpoint, "Score publishing enabled");
            Some(tokio::spawn(async move { publisher.run(cancel).await }))
        }
        None => {
            info!("No publish.endpoint configured; score publishing disabled");
            None
        }
    };

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Some(task) = publisher_task {
        task.await.context("Score publisher panicked")?;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
