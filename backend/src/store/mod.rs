// Persistence seams for the rules and outcome engines.
//
// Every table the engine reads or writes sits behind one of these traits so
// the same engine code runs against PostgreSQL or the in-memory store.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use dealflow_shared::{
    EntitySnapshot, EntityType, EntityWorkflowState, Notification, OutcomeRule, OutcomeType,
    RuleExecution, RuleStatus, StepMapping, WorkflowStep,
};

use crate::rules::BusinessRule;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity_type} {entity_id} was modified concurrently (expected version {expected_version})")]
    ConcurrentConflict {
        entity_type: EntityType,
        entity_id: String,
        expected_version: i64,
    },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
            || matches!(self, Self::Database(sqlx::Error::RowNotFound))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filter for reading the rule execution audit log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub rule_id: Option<Uuid>,
    pub entity_id: Option<String>,
    pub limit: Option<i64>,
}

impl ExecutionQuery {
    pub const DEFAULT_LIMIT: i64 = 100;

    pub fn for_entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    pub fn for_rule(rule_id: Uuid) -> Self {
        Self {
            rule_id: Some(rule_id),
            ..Self::default()
        }
    }

    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, 1000)
    }
}

/// Directed link between two entities, written by conversions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLink {
    pub id: Uuid,
    pub source_entity_type: EntityType,
    pub source_entity_id: String,
    pub target_entity_type: EntityType,
    pub target_entity_id: String,
    pub link_type: String,
    pub created_at: DateTime<Utc>,
}

/// Read side of `business_rules`, plus the admin writes.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// ACTIVE rules for the entity type whose trigger events contain `trigger_event`,
    /// ordered by priority then id.
    async fn applicable_rules(
        &self,
        entity_type: EntityType,
        trigger_event: &str,
    ) -> StoreResult<Vec<BusinessRule>>;

    /// ACTIVE rules with a SCHEDULE trigger, ordered by priority then id.
    async fn scheduled_rules(&self) -> StoreResult<Vec<BusinessRule>>;

    async fn list_rules(
        &self,
        entity_type: Option<EntityType>,
        status: Option<RuleStatus>,
    ) -> StoreResult<Vec<BusinessRule>>;

    async fn get_rule(&self, id: Uuid) -> StoreResult<BusinessRule>;

    async fn insert_rule(&self, rule: &BusinessRule) -> StoreResult<()>;

    async fn set_rule_status(&self, id: Uuid, status: RuleStatus) -> StoreResult<BusinessRule>;
}

/// Append-only `rule_executions` audit log.
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn record_execution(&self, execution: &RuleExecution) -> StoreResult<()>;

    async fn list_executions(&self, query: &ExecutionQuery) -> StoreResult<Vec<RuleExecution>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create_notification(&self, notification: &Notification) -> StoreResult<()>;

    /// Unexpired notifications for a user, newest first.
    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> StoreResult<Vec<Notification>>;

    /// Returns false when no notification with that id belongs to the user.
    async fn mark_read(&self, id: Uuid, user_id: Uuid) -> StoreResult<bool>;

    async fn unread_count(&self, user_id: Uuid) -> StoreResult<i64>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

/// Workflow reference data and the entity step pointer.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn workflow_state(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> StoreResult<EntityWorkflowState>;

    async fn get_step(&self, step_id: Uuid) -> StoreResult<WorkflowStep>;

    async fn active_step_mapping(
        &self,
        workflow_id: Uuid,
        outcome: OutcomeType,
    ) -> StoreResult<Option<StepMapping>>;

    async fn active_outcome_rule(
        &self,
        workflow_id: Uuid,
        outcome: OutcomeType,
    ) -> StoreResult<Option<OutcomeRule>>;

    /// Point the entity at `target_step_id` if its version still equals
    /// `expected_version`. Returns the new version.
    async fn transition_step(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        target_step_id: Uuid,
        expected_version: i64,
    ) -> StoreResult<i64>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn load_snapshot(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> StoreResult<EntitySnapshot>;

    async fn list_snapshots(
        &self,
        entity_type: EntityType,
        limit: i64,
    ) -> StoreResult<Vec<EntitySnapshot>>;

    /// Insert a new entity and return its id.
    async fn create_entity(
        &self,
        entity_type: EntityType,
        fields: &EntitySnapshot,
    ) -> StoreResult<String>;

    async fn link_entities(&self, link: &EntityLink) -> StoreResult<()>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn users_with_role(&self, role: &str) -> StoreResult<Vec<Uuid>>;
}

/// One handle per store concern, usually all backed by the same object.
#[derive(Clone)]
pub struct Stores {
    pub rules: Arc<dyn RuleStore>,
    pub executions: Arc<dyn ExecutionLog>,
    pub notifications: Arc<dyn NotificationStore>,
    pub workflows: Arc<dyn WorkflowStore>,
    pub entities: Arc<dyn EntityStore>,
    pub users: Arc<dyn UserDirectory>,
}

impl Stores {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: RuleStore
            + ExecutionLog
            + NotificationStore
            + WorkflowStore
            + EntityStore
            + UserDirectory
            + 'static,
    {
        Self {
            rules: backend.clone(),
            executions: backend.clone(),
            notifications: backend.clone(),
            workflows: backend.clone(),
            entities: backend.clone(),
            users: backend,
        }
    }
}
