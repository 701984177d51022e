//! REST API Routes Module
//!
//! Route modules, router assembly and the push helpers shared by the
//! mutation endpoints.

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::get,
    Router,
};
use std::time::Duration;
use tally_core::{new_operation_id, BatchChunker, CellChange, SessionId, TenantId};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::constants::{SESSION_HEADER, TENANT_HEADER, USER_HEADER};
use crate::events::SyncMessage;
use crate::state::AppState;
use crate::ws::{ws_handler, Fanout};

pub mod bulk;
pub mod cells;
pub mod changes;
pub mod entities;
pub mod grid;
pub mod health;

// ============================================================================
// PUSH HELPERS
// ============================================================================

/// Push the cell changes of one accepted flush to the tenant's other
/// sessions.
///
/// A single change goes out as `CELL_UPDATED`; up to one chunk as one
/// `CELLS_UPDATED`. Larger sets are split into chunks sharing an
/// operation id and closed by a `SYNC_DONE` sent to every connection,
/// the originator included.
pub fn publish_cell_changes(
    fanout: &Fanout,
    chunker: BatchChunker,
    tenant_id: TenantId,
    origin: &SessionId,
    mut changes: Vec<CellChange>,
) {
    match changes.len() {
        0 => {}
        1 => {
            if let Some(change) = changes.pop() {
                fanout.broadcast_except_session(
                    tenant_id,
                    origin,
                    SyncMessage::cell_updated(origin, change),
                );
            }
        }
        total if !chunker.is_multi_chunk(total) => {
            fanout.broadcast_except_session(
                tenant_id,
                origin,
                SyncMessage::cells_updated(origin, None, 0, 1, changes),
            );
        }
        total => {
            let operation_id = new_operation_id();
            let chunks = chunker.split(changes);
            let chunk_count = chunks.len();
            for (index, chunk) in chunks.into_iter().enumerate() {
                fanout.broadcast_except_session(
                    tenant_id,
                    origin,
                    SyncMessage::cells_updated(origin, Some(operation_id), index, chunk_count, chunk),
                );
            }
            fanout.broadcast_all(
                tenant_id,
                SyncMessage::sync_done(origin, operation_id, chunk_count, total),
            );
        }
    }
}

// ============================================================================
// CORS LAYER
// ============================================================================

/// Build the CORS layer from ApiConfig.
///
/// In development mode (empty origins), allows all origins.
/// In production mode, only allows configured origins.
fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(TENANT_HEADER),
            HeaderName::from_static(USER_HEADER),
            HeaderName::from_static(SESSION_HEADER),
        ])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: Development mode - allowing all origins");
        cors.allow_origin(Any)
    } else {
        tracing::info!(
            "CORS: Production mode - allowing origins: {:?}",
            config.cors_origins
        );
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create the complete API router.
///
/// - `/health` (public)
/// - `/api/v1/ws` WebSocket push channel
/// - `/api/v1/cells/batch`, `/api/v1/cells/bulk` cell writes
/// - `/api/v1/entities` structural mutations
/// - `/api/v1/changes` reconciliation pull
/// - `/api/v1/grid` full snapshot
pub fn create_api_router(state: AppState, config: &ApiConfig) -> Router {
    let api_routes = Router::new()
        .route("/ws", get(ws_handler))
        .nest("/cells", cells::create_router().merge(bulk::create_router()))
        .nest("/entities", entities::create_router())
        .nest("/changes", changes::create_router())
        .nest("/grid", grid::create_router());

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health::create_router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::RecipientFilter;
    use tally_core::{CellValue, FieldKey};

    fn changes(n: usize) -> Vec<CellChange> {
        (0..n)
            .map(|i| CellChange::new(FieldKey::expense(i as i64 + 1, 9), CellValue::Number(i as f64)))
            .collect()
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<crate::ws::Outbound>) -> Vec<crate::ws::Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_single_change_is_cell_updated() {
        let fanout = Fanout::new(64);
        let mut rx = fanout.subscribe();
        publish_cell_changes(&fanout, BatchChunker::new(10), TenantId::new(1), &SessionId::new("s"), changes(1));

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message.event_type(), "CELL_UPDATED");
    }

    #[test]
    fn test_small_batch_is_one_cells_updated() {
        let fanout = Fanout::new(64);
        let mut rx = fanout.subscribe();
        publish_cell_changes(&fanout, BatchChunker::new(10), TenantId::new(1), &SessionId::new("s"), changes(7));

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].message.as_ref(),
            SyncMessage::CellsUpdated { chunk_count: 1, operation_id: None, changes, .. } if changes.len() == 7
        ));
    }

    #[test]
    fn test_multi_chunk_ends_with_sync_done_to_all() {
        let fanout = Fanout::new(64);
        let mut rx = fanout.subscribe();
        let origin = SessionId::new("s");
        let (_conn, _origin_rx) = fanout.register(TenantId::new(1), origin.clone());
        publish_cell_changes(&fanout, BatchChunker::new(10), TenantId::new(1), &origin, changes(25));

        let sent = drain(&mut rx);
        let types: Vec<&str> = sent.iter().map(|o| o.message.event_type()).collect();
        assert_eq!(types, vec!["CELLS_UPDATED", "CELLS_UPDATED", "CELLS_UPDATED", "SYNC_DONE"]);
        assert!(sent[..3].iter().all(|o| matches!(o.filter, RecipientFilter::Except(_))));
        assert_eq!(sent[3].filter, RecipientFilter::All);
    }

    #[test]
    fn test_nothing_published_for_empty_flush() {
        let fanout = Fanout::new(64);
        let mut rx = fanout.subscribe();
        publish_cell_changes(&fanout, BatchChunker::new(10), TenantId::new(1), &SessionId::new("s"), Vec::new());
        assert!(drain(&mut rx).is_empty());
    }
}
