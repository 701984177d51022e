//! Reconciliation pull endpoint.
//!
//! Field updates are read from a `(created_at, id)` cursor, at most
//! `MAX_PULL_EVENTS` per poll. Structural events are read over a
//! look-back window instead, so a session that was offline when an entity
//! was created still discovers it; the dedup ledger hands each of them to a
//! session at most once.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use tally_core::{now, EventKind, SyncConfig};
use tally_storage::{ChangeQuery, SyncStore};
use tracing::debug;

use crate::auth::AuthContext;
use crate::constants::MAX_PULL_EVENTS;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::types::{PullCursor, PullParams, PullResponse};

/// GET /api/v1/changes?since=&sessionId= - Events the session has not seen
pub async fn pull_changes(
    State(store): State<Arc<dyn SyncStore>>,
    State(sync): State<Arc<SyncConfig>>,
    auth: AuthContext,
    Query(params): Query<PullParams>,
) -> ApiResult<Json<PullResponse>> {
    let session_id = params
        .session_id
        .or(auth.session_id)
        .filter(|s| !s.is_blank())
        .ok_or_else(|| ApiError::missing_field("sessionId"))?;
    let tenant_id = auth.tenant_id;

    let pulled_at = now();
    let start = match params.since {
        Some(since) => PullCursor {
            at: since,
            event_id: params.after_id,
        },
        None => PullCursor::at(pulled_at - sync.change_retention_chrono()),
    };

    let query = ChangeQuery::since(tenant_id, start.at)
        .after_event(start.event_id)
        .excluding(session_id.clone())
        .kinds([EventKind::FieldUpdate])
        .limit(MAX_PULL_EVENTS);
    let mut changes = store.query(&query).await?;

    // Ordered by (created_at, id), so a truncated page resumes right after
    // its last event even when the rest of its timestamp group is unread.
    let cursor = changes.last().map_or(start, PullCursor::after);
    let truncated = changes.len() == MAX_PULL_EVENTS;

    let window_start = pulled_at - sync.structural_window_chrono();
    for kind in EventKind::structural() {
        let claimed = store
            .claim_unseen(tenant_id, &session_id, kind, window_start)
            .await?;
        changes.extend(claimed);
    }
    changes.sort_by_key(|e| (e.created_at, e.id));

    debug!(
        tenant_id = %tenant_id,
        session_id = %session_id,
        count = changes.len(),
        cursor = %cursor.at,
        truncated,
        "Pull served"
    );

    Ok(Json(PullResponse { changes, cursor }))
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/", get(pull_changes))
}
