use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, put},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use dealflow_shared::Notification;

use crate::AppState;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

pub fn notification_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_notifications))
        .route("/unread-count", get(unread_count))
        .route("/:id/read", put(mark_read))
}

#[derive(Debug, Deserialize)]
pub struct NotificationListParams {
    pub user_id: Uuid,
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RecipientParams {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCount {
    pub user_id: Uuid,
    pub unread_count: i64,
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NotificationListParams>,
) -> Result<Json<Vec<Notification>>, StatusCode> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let notifications = state
        .stores
        .notifications
        .list_notifications(params.user_id, params.unread_only, limit)
        .await
        .map_err(|e| {
            tracing::error!("Error fetching notifications: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(notifications))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<RecipientParams>,
) -> Result<StatusCode, StatusCode> {
    let updated = state
        .stores
        .notifications
        .mark_read(id, params.user_id)
        .await
        .map_err(|e| {
            tracing::error!("Error marking notification {} read: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if updated {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecipientParams>,
) -> Result<Json<UnreadCount>, StatusCode> {
    let unread_count = state
        .stores
        .notifications
        .unread_count(params.user_id)
        .await
        .map_err(|e| {
            tracing::error!("Error counting unread notifications: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(UnreadCount {
        user_id: params.user_id,
        unread_count,
    }))
}
