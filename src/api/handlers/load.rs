use axum::{extract::State, Json};
use serde_json::{json, Value as JsonValue};
use tracing::info;

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::LoadRequest;

/// Force a run of one job; does not wait for the outcome
pub async fn load(
    State(state): State<AppState>,
    Json(payload): Json<LoadRequest>,
) -> Result<Json<JsonValue>, AppError> {
    info!("Forced run requested for {}", payload.loader_id);
    state.engine.run_job(&payload.loader_id)?;
    Ok(Json(json!({ "status": "ok" })))
}
