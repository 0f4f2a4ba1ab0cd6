use axum::{
    extract::{Query, State},
    Json,
};
use tracing::{error, info};

use crate::api::handlers::AppState;
use crate::models::{QueryParams, QueryResponse};

/// Run ad-hoc SQL
///
/// Engine errors come back as `{"type": "error"}` with status 200, never as
/// partial results.
pub async fn query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Json<QueryResponse> {
    let sql = params.query.trim();
    if sql.is_empty() {
        return Json(QueryResponse::Error {
            message: "SQL query cannot be empty".to_string(),
        });
    }

    info!("Executing query");
    match state.engine.query(sql).await {
        Ok(result) => Json(QueryResponse::from(result)),
        Err(e) => {
            error!("Query failed: {}", e);
            Json(QueryResponse::Error {
                message: e.to_string(),
            })
        }
    }
}
