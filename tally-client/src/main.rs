//! Tally client entry point: a headless grid mirror.
//!
//! Loads the grid, follows the push channel, and reconciles on the poll
//! interval until interrupted.

use std::sync::Arc;
use tally_client::autosave::AutosaveEvent;
use tally_client::realtime::spawn_ws_manager;
use tally_client::{ClientConfig, RestClient, SyncBackend, SyncSession, WsClient};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tally_client=info")),
        )
        .init();

    let config = ClientConfig::load()?;
    let session_id = config.session();
    let sync = config.sync_config();

    let backend: Arc<dyn SyncBackend> = Arc::new(RestClient::new(&config, &session_id)?);
    let ws = WsClient::new(&config, &session_id)?;

    let (mut session, mut autosave_events) =
        SyncSession::new(backend, session_id.clone(), &sync, config.frame());
    session.load().await?;
    tracing::info!(
        session_id = %session_id,
        tenant_id = %config.tenant(),
        cells = session.grid().filled_cells(),
        "Mirror ready"
    );

    tokio::spawn(async move {
        while let Some(event) = autosave_events.recv().await {
            match event {
                AutosaveEvent::RetriesExhausted { attempts, pending } => {
                    tracing::error!(attempts, pending, "Edits are not being saved");
                }
                other => tracing::debug!(event = ?other, "Autosave"),
            }
        }
    });

    let (event_tx, event_rx) = mpsc::channel(256);
    let ws_task = spawn_ws_manager(ws, event_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    session.run(event_rx, shutdown_rx).await;
    ws_task.abort();

    let unsaved = session.close().await;
    if !unsaved.is_empty() {
        tracing::warn!(pending = unsaved.len(), "Exiting with unsaved edits");
    }
    Ok(())
}
