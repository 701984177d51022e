//! Full grid snapshot for initial load and full refresh.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tally_core::GridSnapshot;
use tally_storage::SyncStore;

use crate::auth::AuthContext;
use crate::error::ApiResult;
use crate::state::AppState;

/// GET /api/v1/grid - Rows, columns and every non-empty cell of the tenant
pub async fn get_grid(
    State(store): State<Arc<dyn SyncStore>>,
    auth: AuthContext,
) -> ApiResult<Json<GridSnapshot>> {
    let snapshot = store.snapshot(auth.tenant_id).await?;
    Ok(Json(snapshot))
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/", get(get_grid))
}
