//! cnfl-sync server entry point.
//!
//! Connects the configured backend, starts the snapshot load, and serves
//! the REST and WebSocket endpoints until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use cnfl_sync::api;
use cnfl_sync::app_state::AppState;
use cnfl_sync::config::{Backend, LogFormat, SyncConfig};
use cnfl_sync::gateway::{DataGateway, MemoryBackend, PgGateway};
use cnfl_sync::service::SnapshotStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config =
        SyncConfig::from_env().map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    // Initialize tracing
    init_tracing(config.log_format);
    tracing::info!(addr = %config.listen_addr, backend = ?config.backend, "starting cnfl-sync");

    // Build gateway
    let gateway: Arc<dyn DataGateway> = match config.backend {
        Backend::Postgres => {
            let pg = PgGateway::connect(
                &config.database_url,
                config.database_max_connections,
                config.database_min_connections,
                config.database_connect_timeout(),
                config.change_channel.clone(),
            )
            .await
            .context("connecting to PostgreSQL")?;
            if config.run_migrations {
                pg.migrate().await.context("applying migrations")?;
                tracing::info!("migrations applied");
            }
            Arc::new(pg)
        }
        Backend::Memory => Arc::new(MemoryBackend::new()),
    };

    // Build service layer; the load runs while the server already answers
    let store = Arc::new(SnapshotStore::new(gateway, config.store_options()));
    let loader = store.start_in_background();

    // Build router
    let app = api::build_app(AppState::new(Arc::clone(&store)));

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    store.shutdown().await;
    // A load still in flight finishes on its own (bounded by the load
    // timeout) and reports `Closed`; its result is discarded.
    match loader.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::info!(error = %e, "snapshot load ended without data"),
        Err(e) => tracing::warn!(error = %e, "snapshot loader task failed"),
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl+c");
        std::future::pending::<()>().await;
    }
}
