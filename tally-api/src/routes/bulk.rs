//! Bulk mutation endpoint (pasted ranges, batch corrections).
//!
//! The change list is persisted one chunk at a time and every chunk is
//! pushed as soon as it is durable. Once the last chunk is persisted a
//! `SYNC_DONE` goes to every connection so receivers know the operation is
//! wholly visible.

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use tally_core::{new_operation_id, now, BatchChunker, SyncConfig, TallyError};
use tally_storage::SyncStore;
use tracing::{debug, info};

use crate::auth::AuthContext;
use crate::constants::MAX_BULK_RECORDS;
use crate::error::{ApiError, ApiResult};
use crate::events::SyncMessage;
use crate::routes::cells::{persist_change, RecordOutcome};
use crate::state::AppState;
use crate::types::{BulkRequest, BulkResponse, RecordError};
use crate::validation::RecordValidator;
use crate::ws::Fanout;

/// POST /api/v1/cells/bulk - Apply a large change list in chunks
pub async fn bulk_update(
    State(store): State<Arc<dyn SyncStore>>,
    State(fanout): State<Arc<Fanout>>,
    State(sync): State<Arc<SyncConfig>>,
    auth: AuthContext,
    Json(req): Json<BulkRequest>,
) -> ApiResult<Json<BulkResponse>> {
    let origin = auth.require_origin()?;
    let total = req.changes.len();
    if total == 0 {
        return Err(ApiError::invalid_input("Bulk update carries no changes"));
    }
    if total > MAX_BULK_RECORDS {
        return Err(ApiError::invalid_input(format!(
            "Bulk update carries {} records, limit is {}",
            total, MAX_BULK_RECORDS
        )));
    }

    let operation_id = req.operation_id.unwrap_or_else(new_operation_id);
    let chunker = BatchChunker::new(sync.chunk_size);
    let chunk_count = chunker.chunk_count(total);
    let accepted_at = now();
    let mut validator = RecordValidator::new(store.as_ref(), origin.tenant_id);

    let mut saved = 0;
    let mut skipped = 0;
    let mut errors = Vec::new();

    for (chunk_index, chunk) in chunker.chunks(&req.changes).enumerate() {
        let offset = chunk_index * chunker.chunk_size();
        let mut applied = Vec::with_capacity(chunk.len());

        for (i, change) in chunk.iter().enumerate() {
            let index = offset + i;
            let change = match validator.validate_change(change).await {
                Ok(change) => change,
                Err(TallyError::Validation(reason)) => {
                    errors.push(RecordError {
                        index,
                        reason: reason.to_string(),
                    });
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            // A storage failure ends the request without SYNC_DONE. Chunks
            // already announced stay applied; receivers expire the operation
            // and catch up on the rest by pull.
            match persist_change(store.as_ref(), &origin, accepted_at, change).await? {
                RecordOutcome::Saved(change) => {
                    saved += 1;
                    applied.push(change);
                }
                RecordOutcome::Skipped => skipped += 1,
                RecordOutcome::Rejected(reason) => errors.push(RecordError { index, reason }),
            }
        }

        debug!(
            operation_id = %operation_id,
            chunk_index,
            chunk_count,
            applied = applied.len(),
            "Bulk chunk persisted"
        );
        // Every chunk is announced, even when nothing in it applied, so
        // receivers can count chunks against chunk_count.
        fanout.broadcast_except_session(
            origin.tenant_id,
            &origin.session_id,
            SyncMessage::cells_updated(
                &origin.session_id,
                Some(operation_id),
                chunk_index,
                chunk_count,
                applied,
            ),
        );
    }

    fanout.broadcast_all(
        origin.tenant_id,
        SyncMessage::sync_done(&origin.session_id, operation_id, chunk_count, total),
    );

    info!(
        tenant_id = %origin.tenant_id,
        session_id = %origin.session_id,
        operation_id = %operation_id,
        saved,
        total,
        skipped,
        chunk_count,
        "Bulk update persisted"
    );

    Ok(Json(BulkResponse {
        operation_id,
        saved,
        total,
        skipped,
        chunk_count,
        errors,
    }))
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/bulk", post(bulk_update))
}
