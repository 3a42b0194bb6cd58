use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::post,
};
use std::sync::Arc;

use dealflow_shared::{WfmOutcomeExecutionRequest, WfmOutcomeExecutionResult};

use crate::AppState;

pub fn outcome_routes() -> Router<Arc<AppState>> {
    Router::new().route("/execute", post(execute_outcome))
}

/// Rejected outcomes come back as 422 with the same result body, so callers
/// can show the reason.
async fn execute_outcome(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WfmOutcomeExecutionRequest>,
) -> (StatusCode, Json<WfmOutcomeExecutionResult>) {
    let result = state.executor.execute(&request).await;

    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };

    (status, Json(result))
}
