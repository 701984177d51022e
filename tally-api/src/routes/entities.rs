//! Structural mutations: entity creation and deletion.
//!
//! Both commit the entity change and its structural event together. Live
//! sessions are told by push; sessions that were offline discover the event
//! through the pull endpoint's structural window.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, post},
    Json, Router,
};
use tally_core::EntityId;
use tally_storage::SyncStore;
use tracing::info;

use crate::auth::AuthContext;
use crate::error::{ApiError, ApiResult};
use crate::events::SyncMessage;
use crate::state::AppState;
use crate::types::{CreateEntityRequest, DeleteEntityResponse};
use crate::ws::Fanout;

/// POST /api/v1/entities - Create an account row or client column
pub async fn create_entity(
    State(store): State<Arc<dyn SyncStore>>,
    State(fanout): State<Arc<Fanout>>,
    auth: AuthContext,
    Json(req): Json<CreateEntityRequest>,
) -> ApiResult<impl IntoResponse> {
    let origin = auth.require_origin()?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::missing_field("name"));
    }

    let (entity, event) = store.create_entity(&origin, req.kind, name).await?;

    info!(
        tenant_id = %origin.tenant_id,
        entity_id = %entity.id,
        event_id = %event.id,
        kind = entity.kind.as_db_str(),
        "Entity created"
    );

    fanout.broadcast_except_session(
        origin.tenant_id,
        &origin.session_id,
        SyncMessage::entity_created(&origin.session_id, entity.clone()),
    );

    Ok((StatusCode::CREATED, Json(entity)))
}

/// DELETE /api/v1/entities/:id - Delete an entity and its cells
pub async fn delete_entity(
    State(store): State<Arc<dyn SyncStore>>,
    State(fanout): State<Arc<Fanout>>,
    auth: AuthContext,
    Path(id): Path<i64>,
) -> ApiResult<Json<DeleteEntityResponse>> {
    let origin = auth.require_origin()?;
    let entity_id = EntityId::new(id);

    let event = store.delete_entity(&origin, entity_id).await?;

    info!(
        tenant_id = %origin.tenant_id,
        entity_id = %entity_id,
        event_id = %event.id,
        "Entity deleted"
    );

    fanout.broadcast_except_session(
        origin.tenant_id,
        &origin.session_id,
        SyncMessage::refresh_required(&origin.session_id, "entity deleted", Some(entity_id)),
    );

    Ok(Json(DeleteEntityResponse {
        entity_id,
        deleted: true,
    }))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_entity))
        .route("/:id", delete(delete_entity))
}
