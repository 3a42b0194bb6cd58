//! HTTP error surface for the DealFlow API
//!
//! Engine entry points report business failures in their result objects
//! (`RuleProcessingSummary`, `WfmOutcomeExecutionResult`); this module only
//! covers requests the API itself cannot serve.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::store::StoreError;

/// Field name -> problems with that field.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// JSON body of every non-2xx response produced through `AppError`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable machine-readable code, e.g. `VALIDATION_ERROR`
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<FieldErrors>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Validation failed")]
    ValidationError { details: FieldErrors },
    #[error("{0}")]
    BadRequest(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn invalid_field(field: &str, message: &str) -> Self {
        ValidationBuilder::new()
            .error(field, message)
            .build()
            .unwrap_or_else(|| Self::BadRequest(message.to_string()))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Internal details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            Self::Internal(msg) => tracing::error!("Request failed: {}", msg),
            Self::ServiceUnavailable(msg) => tracing::warn!("Store unavailable: {}", msg),
            _ => {}
        }

        let status = self.status_code();
        let body = ApiError {
            code: self.error_code().to_string(),
            message: self.public_message(),
            details: match self {
                Self::ValidationError { details } => Some(details),
                _ => None,
            },
            timestamp: Utc::now(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound(format!("{} {}", entity, id)),
            StoreError::Database(sqlx::Error::RowNotFound) => Self::NotFound("Record".to_string()),
            StoreError::ConcurrentConflict { .. } => Self::Conflict(err.to_string()),
            StoreError::Unavailable(msg) => Self::ServiceUnavailable(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, AppError>;

/// Collects field errors; `build` yields `None` when there were none.
#[derive(Debug, Default)]
pub struct ValidationBuilder {
    details: FieldErrors,
}

impl ValidationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(mut self, field: &str, message: impl Into<String>) -> Self {
        self.details
            .entry(field.to_string())
            .or_default()
            .push(message.into());
        self
    }

    pub fn build(self) -> Option<AppError> {
        (!self.details.is_empty()).then_some(AppError::ValidationError {
            details: self.details,
        })
    }
}
