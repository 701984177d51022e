//! Tally API Server Entry Point
//!
//! Loads configuration from the environment, picks the store backend and
//! starts the Axum server with the retention sweep running alongside.

use std::sync::Arc;

use tally_api::jobs::{retention_sweep_task, RetentionSweepConfig};
use tally_api::telemetry::{init_tracing, LogFormat};
use tally_api::{create_api_router, ApiConfig, ApiError, ApiResult, AppState, DbConfig, Fanout, PgStore, StoreKind};
use tally_storage::{InMemoryStore, SyncStore};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_tracing(LogFormat::from_env())?;

    let config = ApiConfig::from_env();
    config.validate()?;

    let (store, store_kind): (Arc<dyn SyncStore>, StoreKind) =
        match DbConfig::from_api_config(&config) {
            Some(db_config) => {
                let pg = PgStore::from_config(&db_config)?;
                pg.bootstrap().await?;
                tracing::info!(pool_size = pg.pool_size(), "Using PostgreSQL store");
                (Arc::new(pg), StoreKind::Postgres)
            }
            None => {
                if config.is_production() {
                    tracing::warn!("TALLY_DATABASE_URL not set; changes will not survive a restart");
                }
                (Arc::new(InMemoryStore::new()), StoreKind::Memory)
            }
        };

    let fanout = Arc::new(Fanout::new(config.ws_buffer));
    let state = AppState::new(store.clone(), store_kind, fanout, config.sync.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = tokio::spawn(retention_sweep_task(
        store,
        RetentionSweepConfig::from_sync(&config.sync),
        shutdown_rx,
    ));

    let app = create_api_router(state, &config);
    let addr = config.bind_addr()?;
    tracing::info!(%addr, store = store_kind.as_str(), "Starting Tally API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweep.await {
        tracing::warn!(error = %e, "Retention sweep task did not stop cleanly");
    }
    Ok(())
}
