//! Autosave flush endpoint.
//!
//! Each record is validated on its own: a bad record is reported and
//! skipped, the rest of the batch is persisted. A storage failure fails the
//! whole request so the client keeps its buffer and retries; records that
//! committed before the failure are still pushed.

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use tally_core::{
    now, BatchChunker, CellChange, Origin, StorageError, SyncConfig, TallyError, TallyResult,
    Timestamp,
};
use tally_storage::{CellWrite, CellWriteOutcome, SyncStore};
use tracing::{debug, info, warn};

use crate::auth::AuthContext;
use crate::constants::MAX_FLUSH_RECORDS;
use crate::error::{ApiError, ApiResult};
use crate::routes::publish_cell_changes;
use crate::state::AppState;
use crate::types::{FlushRequest, FlushResponse, RecordError};
use crate::validation::RecordValidator;
use crate::ws::Fanout;

/// What happened to one validated record.
pub(crate) enum RecordOutcome {
    Saved(CellChange),
    /// A newer value was already stored.
    Skipped,
    Rejected(String),
}

/// Write one validated change with its change event.
///
/// Only storage failures are errors; a row that disappeared since
/// validation is a rejected record.
pub(crate) async fn persist_change(
    store: &dyn SyncStore,
    origin: &Origin,
    accepted_at: Timestamp,
    change: CellChange,
) -> TallyResult<RecordOutcome> {
    let write = CellWrite {
        origin: origin.clone(),
        key: change.key(),
        value: change.value.clone(),
        accepted_at,
    };
    match store.write_cell(write).await {
        Ok(CellWriteOutcome::Applied(_)) => Ok(RecordOutcome::Saved(change)),
        Ok(CellWriteOutcome::Superseded { stored_at }) => {
            debug!(key = %change.key(), stored_at = %stored_at, "Newer value already stored");
            Ok(RecordOutcome::Skipped)
        }
        Err(TallyError::Storage(StorageError::EntityNotFound { id })) => Ok(
            RecordOutcome::Rejected(format!("Entity {} no longer exists", id)),
        ),
        Err(err) => Err(err),
    }
}

/// POST /api/v1/cells/batch - Persist a buffered set of cell edits
pub async fn flush_cells(
    State(store): State<Arc<dyn SyncStore>>,
    State(fanout): State<Arc<Fanout>>,
    State(sync): State<Arc<SyncConfig>>,
    auth: AuthContext,
    Json(req): Json<FlushRequest>,
) -> ApiResult<Json<FlushResponse>> {
    let origin = auth.require_origin()?;
    let total = req.changes.len();
    if total > MAX_FLUSH_RECORDS {
        return Err(ApiError::invalid_input(format!(
            "Flush carries {} records, limit is {}",
            total, MAX_FLUSH_RECORDS
        )));
    }

    let accepted_at = now();
    let mut validator = RecordValidator::new(store.as_ref(), origin.tenant_id);
    let mut response = FlushResponse {
        total,
        ..FlushResponse::default()
    };
    let mut applied = Vec::with_capacity(total);
    let publish = |applied: Vec<CellChange>| {
        publish_cell_changes(
            &fanout,
            BatchChunker::new(sync.chunk_size),
            origin.tenant_id,
            &origin.session_id,
            applied,
        )
    };

    for (index, record) in req.changes.iter().enumerate() {
        let outcome = match validator.validate_record(record).await {
            Ok(change) => persist_change(store.as_ref(), &origin, accepted_at, change).await,
            Err(TallyError::Validation(reason)) => {
                debug!(index, reason = %reason, "Skipping invalid flush record");
                response.errors.push(RecordError {
                    index,
                    reason: reason.to_string(),
                });
                continue;
            }
            Err(err) => Err(err),
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    index,
                    committed = applied.len(),
                    error = %err,
                    "Flush failed part way"
                );
                // Committed records are durable; the client's retry is idempotent.
                publish(applied);
                return Err(err.into());
            }
        };

        match outcome {
            RecordOutcome::Saved(change) => {
                response.saved += 1;
                applied.push(change);
            }
            RecordOutcome::Skipped => response.skipped += 1,
            RecordOutcome::Rejected(reason) => response.errors.push(RecordError { index, reason }),
        }
    }

    info!(
        tenant_id = %origin.tenant_id,
        session_id = %origin.session_id,
        saved = response.saved,
        total = response.total,
        skipped = response.skipped,
        rejected = response.rejected(),
        "Flush persisted"
    );

    publish(applied);

    Ok(Json(response))
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/batch", post(flush_cells))
}
