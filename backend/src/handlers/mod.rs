use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;
use crate::database;

pub mod notifications;
pub mod outcomes;
pub mod rules;

pub use notifications::notification_routes;
pub use outcomes::outcome_routes;
pub use rules::rule_routes;

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let Some(pool) = &state.db_pool else {
        return (
            StatusCode::OK,
            Json(json!({"status": "healthy", "service": "dealflow-api", "store": "memory"})),
        );
    };

    let health = database::health_check(pool).await;
    let status = if health.reachable {
        StatusCode::OK
    } else {
        tracing::error!("Health check failed: database unreachable");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if health.reachable { "healthy" } else { "unhealthy" },
            "service": "dealflow-api",
            "store": "postgres",
            "database": health,
        })),
    )
}
