use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value as JsonValue};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::handlers::{load, query, AppState};
use crate::api::middleware::require_bearer;

/// Create the control-surface router
///
/// `/healthcheck` is open; every other route requires the bearer token.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/query", get(query::query))
        .route("/load", post(load::load))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/healthcheck", get(health_check))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> Json<JsonValue> {
    Json(json!({ "message": "pong" }))
}
