use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use dealflow_shared::{
    ChangeDelta, EntitySnapshot, EntityType, RuleExecution, RuleProcessingSummary, RuleStatus,
    TriggerType,
};

use crate::AppState;
use crate::error::{ApiResult, AppError};
use crate::rules::{BusinessRule, ConditionClause, DEFAULT_PRIORITY, RuleAction};
use crate::store::ExecutionQuery;

pub fn rule_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_rules).post(create_rule))
        .route("/process", post(process_rules))
        .route("/executions", get(list_executions))
        .route("/:id", get(get_rule))
        .route("/:id/deactivate", post(deactivate_rule))
}

#[derive(Debug, Deserialize)]
pub struct ProcessRulesRequest {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub trigger_event: String,
    #[serde(default)]
    pub snapshot: EntitySnapshot,
    #[serde(default)]
    pub delta: ChangeDelta,
}

async fn process_rules(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ProcessRulesRequest>,
) -> ApiResult<Json<RuleProcessingSummary>> {
    if payload.entity_id.trim().is_empty() {
        return Err(AppError::invalid_field("entity_id", "Entity id is required"));
    }
    if payload.trigger_event.trim().is_empty() {
        return Err(AppError::invalid_field("trigger_event", "Trigger event is required"));
    }

    let mut snapshot = payload.snapshot;
    match snapshot.id() {
        None => snapshot.insert("id", payload.entity_id.clone()),
        Some(id) if id != payload.entity_id => {
            return Err(AppError::invalid_field(
                "snapshot",
                "Snapshot id does not match entity_id",
            ));
        }
        Some(_) => {}
    }

    let summary = state
        .engine
        .process_business_rules(
            payload.entity_type,
            &payload.entity_id,
            &payload.trigger_event,
            snapshot,
            payload.delta,
        )
        .await;

    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct RuleListParams {
    pub entity_type: Option<String>,
    pub status: Option<String>,
}

async fn list_rules(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RuleListParams>,
) -> ApiResult<Json<Vec<BusinessRule>>> {
    let entity_type = params
        .entity_type
        .as_deref()
        .map(str::parse::<EntityType>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let status = params
        .status
        .as_deref()
        .map(str::parse::<RuleStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let rules = state.stores.rules.list_rules(entity_type, status).await?;
    Ok(Json(rules))
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BusinessRule>> {
    Ok(Json(state.stores.rules.get_rule(id).await?))
}

fn default_trigger_type() -> TriggerType {
    TriggerType::Event
}

fn default_status() -> RuleStatus {
    RuleStatus::Active
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub description: Option<String>,
    pub entity_type: EntityType,
    #[serde(default = "default_trigger_type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_events: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionClause>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    #[serde(default = "default_status")]
    pub status: RuleStatus,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

impl From<CreateRuleRequest> for BusinessRule {
    fn from(req: CreateRuleRequest) -> Self {
        BusinessRule {
            id: Uuid::new_v4(),
            name: req.name.trim().to_string(),
            description: req.description,
            entity_type: req.entity_type,
            trigger_type: req.trigger_type,
            trigger_events: req.trigger_events,
            conditions: req.conditions,
            actions: req.actions,
            status: req.status,
            priority: req.priority,
            last_updated: Utc::now(),
        }
    }
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRuleRequest>,
) -> ApiResult<(StatusCode, Json<BusinessRule>)> {
    let rule = BusinessRule::from(payload);
    rule.validate()?;

    state.stores.rules.insert_rule(&rule).await?;
    tracing::info!(rule_id = %rule.id, name = %rule.name, entity_type = %rule.entity_type, "Business rule created");

    Ok((StatusCode::CREATED, Json(rule)))
}

async fn deactivate_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BusinessRule>> {
    let rule = state
        .stores
        .rules
        .set_rule_status(id, RuleStatus::Inactive)
        .await?;
    tracing::info!(rule_id = %id, "Business rule deactivated");
    Ok(Json(rule))
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExecutionQuery>,
) -> ApiResult<Json<Vec<RuleExecution>>> {
    let executions = state.stores.executions.list_executions(&query).await?;
    Ok(Json(executions))
}
