// PostgreSQL store - sqlx implementation of every store trait
//
// Entity tables are addressed through `EntityType::table_name()`, a closed
// set, so interpolating the table name into SQL is safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

use dealflow_shared::{
    EntitySnapshot, EntityType, EntityWorkflowState, ExecutionStatus, Notification,
    NotificationPriority, OutcomeRule, OutcomeType, RuleExecution, RuleStatus, StepMapping,
    TriggerType, WorkflowStep,
};

use super::{
    EntityLink, EntityStore, ExecutionLog, ExecutionQuery, NotificationStore, RuleStore,
    StoreError, StoreResult, UserDirectory, WorkflowStore,
};
use crate::rules::BusinessRule;

const RULE_COLUMNS: &str = "id, name, description, entity_type, trigger_type, trigger_events, \
     conditions, actions, status, priority, last_updated";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse<T: FromStr<Err = String>>(raw: &str) -> StoreResult<T> {
    T::from_str(raw).map_err(StoreError::InvalidData)
}

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    entity_type: String,
    trigger_type: String,
    trigger_events: Vec<String>,
    conditions: JsonValue,
    actions: JsonValue,
    status: String,
    priority: i32,
    last_updated: DateTime<Utc>,
}

impl TryFrom<RuleRow> for BusinessRule {
    type Error = StoreError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(BusinessRule {
            id: row.id,
            name: row.name,
            description: row.description,
            entity_type: parse(&row.entity_type)?,
            trigger_type: parse::<TriggerType>(&row.trigger_type)?,
            trigger_events: row.trigger_events,
            conditions: serde_json::from_value(row.conditions)?,
            actions: serde_json::from_value(row.actions)?,
            status: parse(&row.status)?,
            priority: row.priority,
            last_updated: row.last_updated,
        })
    }
}

/// Convert rule rows, skipping malformed ones so one bad definition cannot
/// block every other rule.
fn rules_from_rows(rows: Vec<RuleRow>) -> Vec<BusinessRule> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id;
            match BusinessRule::try_from(row) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(rule_id = %id, error = %e, "Skipping malformed business rule");
                    None
                }
            }
        })
        .collect()
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    rule_id: Uuid,
    entity_type: String,
    entity_id: String,
    execution_trigger: String,
    conditions_met: bool,
    execution_time_ms: i64,
    notifications_created: i32,
    status: String,
    errors: JsonValue,
    executed_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for RuleExecution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(RuleExecution {
            id: row.id,
            rule_id: row.rule_id,
            entity_type: parse(&row.entity_type)?,
            entity_id: row.entity_id,
            execution_trigger: row.execution_trigger,
            conditions_met: row.conditions_met,
            execution_time_ms: row.execution_time_ms,
            notifications_created: row.notifications_created,
            status: parse::<ExecutionStatus>(&row.status)?,
            errors: serde_json::from_value(row.errors)?,
            executed_at: row.executed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    notification_type: String,
    title: String,
    message: String,
    priority: String,
    user_id: Uuid,
    entity_type: Option<String>,
    entity_id: Option<String>,
    rule_id: Option<Uuid>,
    metadata: JsonValue,
    created_at: DateTime<Utc>,
    is_read: bool,
    expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            notification_type: row.notification_type,
            title: row.title,
            message: row.message,
            priority: parse::<NotificationPriority>(&row.priority)?,
            user_id: row.user_id,
            entity_type: row.entity_type.as_deref().map(parse).transpose()?,
            entity_id: row.entity_id,
            rule_id: row.rule_id,
            metadata: row.metadata,
            created_at: row.created_at,
            is_read: row.is_read,
            expires_at: row.expires_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WorkflowStateRow {
    workflow_id: Option<Uuid>,
    version: i64,
    step_id: Uuid,
    step_workflow_id: Uuid,
    status_id: Uuid,
    step_order: i32,
    is_initial_step: bool,
    is_final_step: bool,
    metadata: JsonValue,
}

#[derive(Debug, sqlx::FromRow)]
struct SideEffectRow {
    id: Uuid,
    workflow_id: Uuid,
    outcome_type: String,
    target_step_id: Option<Uuid>,
    is_active: bool,
    side_effects: JsonValue,
}

impl SideEffectRow {
    fn into_mapping(self) -> StoreResult<StepMapping> {
        let target_step_id = self
            .target_step_id
            .ok_or_else(|| StoreError::InvalidData(format!("step mapping {} has no target", self.id)))?;
        Ok(StepMapping {
            id: self.id,
            workflow_id: self.workflow_id,
            outcome_type: parse::<OutcomeType>(&self.outcome_type)?,
            target_step_id,
            is_active: self.is_active,
            side_effects: serde_json::from_value(self.side_effects)?,
        })
    }

    fn into_outcome_rule(self) -> StoreResult<OutcomeRule> {
        Ok(OutcomeRule {
            id: self.id,
            workflow_id: self.workflow_id,
            outcome_type: parse::<OutcomeType>(&self.outcome_type)?,
            is_active: self.is_active,
            side_effects: serde_json::from_value(self.side_effects)?,
        })
    }
}

#[async_trait]
impl RuleStore for PgStore {
    async fn applicable_rules(
        &self,
        entity_type: EntityType,
        trigger_event: &str,
    ) -> StoreResult<Vec<BusinessRule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RULE_COLUMNS}
            FROM business_rules
            WHERE status = 'ACTIVE' AND entity_type = $1 AND $2 = ANY(trigger_events)
            ORDER BY priority ASC, id ASC
            "#
        ))
        .bind(entity_type.as_str())
        .bind(trigger_event)
        .fetch_all(&self.pool)
        .await?;

        Ok(rules_from_rows(rows))
    }

    async fn scheduled_rules(&self) -> StoreResult<Vec<BusinessRule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RULE_COLUMNS}
            FROM business_rules
            WHERE status = 'ACTIVE' AND trigger_type = 'SCHEDULE'
            ORDER BY priority ASC, id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rules_from_rows(rows))
    }

    async fn list_rules(
        &self,
        entity_type: Option<EntityType>,
        status: Option<RuleStatus>,
    ) -> StoreResult<Vec<BusinessRule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RULE_COLUMNS}
            FROM business_rules
            WHERE ($1::text IS NULL OR entity_type = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY priority ASC, id ASC
            "#
        ))
        .bind(entity_type.map(|t| t.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        Ok(rules_from_rows(rows))
    }

    async fn get_rule(&self, id: Uuid) -> StoreResult<BusinessRule> {
        let row: Option<RuleRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM business_rules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| StoreError::not_found("Rule", id))?.try_into()
    }

    async fn insert_rule(&self, rule: &BusinessRule) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO business_rules (
                id, name, description, entity_type, trigger_type, trigger_events,
                conditions, actions, status, priority, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.entity_type.as_str())
        .bind(rule.trigger_type.as_str())
        .bind(&rule.trigger_events)
        .bind(serde_json::to_value(&rule.conditions)?)
        .bind(serde_json::to_value(&rule.actions)?)
        .bind(rule.status.as_str())
        .bind(rule.priority)
        .bind(rule.last_updated)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_rule_status(&self, id: Uuid, status: RuleStatus) -> StoreResult<BusinessRule> {
        let row: Option<RuleRow> = sqlx::query_as(&format!(
            r#"
            UPDATE business_rules
            SET status = $2, last_updated = NOW()
            WHERE id = $1
            RETURNING {RULE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| StoreError::not_found("Rule", id))?.try_into()
    }
}

#[async_trait]
impl ExecutionLog for PgStore {
    async fn record_execution(&self, execution: &RuleExecution) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rule_executions (
                id, rule_id, entity_type, entity_id, execution_trigger, conditions_met,
                execution_time_ms, notifications_created, status, errors, executed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(execution.id)
        .bind(execution.rule_id)
        .bind(execution.entity_type.as_str())
        .bind(&execution.entity_id)
        .bind(&execution.execution_trigger)
        .bind(execution.conditions_met)
        .bind(execution.execution_time_ms)
        .bind(execution.notifications_created)
        .bind(execution.status.as_str())
        .bind(serde_json::to_value(&execution.errors)?)
        .bind(execution.executed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_executions(&self, query: &ExecutionQuery) -> StoreResult<Vec<RuleExecution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT id, rule_id, entity_type, entity_id, execution_trigger, conditions_met,
                   execution_time_ms, notifications_created, status, errors, executed_at
            FROM rule_executions
            WHERE ($1::uuid IS NULL OR rule_id = $1)
              AND ($2::text IS NULL OR entity_id = $2)
            ORDER BY executed_at DESC
            LIMIT $3
            "#,
        )
        .bind(query.rule_id)
        .bind(query.entity_id.as_deref())
        .bind(query.effective_limit())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RuleExecution::try_from).collect()
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn create_notification(&self, notification: &Notification) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, notification_type, title, message, priority, user_id, entity_type,
                entity_id, rule_id, metadata, created_at, is_read, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(notification.id)
        .bind(&notification.notification_type)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.priority.as_str())
        .bind(notification.user_id)
        .bind(notification.entity_type.map(|t| t.as_str()))
        .bind(&notification.entity_id)
        .bind(notification.rule_id)
        .bind(&notification.metadata)
        .bind(notification.created_at)
        .bind(notification.is_read)
        .bind(notification.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> StoreResult<Vec<Notification>> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            r#"
            SELECT id, notification_type, title, message, priority, user_id, entity_type,
                   entity_id, rule_id, metadata, created_at, is_read, expires_at
            FROM notifications
            WHERE user_id = $1
              AND (expires_at IS NULL OR expires_at > NOW())
              AND (NOT $2 OR is_read = FALSE)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(unread_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn mark_read(&self, id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE notifications SET is_read = TRUE WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn unread_count(&self, user_id: Uuid) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM notifications
            WHERE user_id = $1 AND is_read = FALSE
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM notifications WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn workflow_state(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> StoreResult<EntityWorkflowState> {
        let row: Option<WorkflowStateRow> = sqlx::query_as(&format!(
            r#"
            SELECT e.workflow_id, e.version,
                   s.id AS step_id, s.workflow_id AS step_workflow_id, s.status_id,
                   s.step_order, s.is_initial_step, s.is_final_step, s.metadata
            FROM {} e
            JOIN workflow_steps s ON s.id = e.current_step_id
            WHERE e.id = $1
            "#,
            entity_type.table_name()
        ))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| StoreError::not_found(entity_type.as_str(), entity_id))?;

        Ok(EntityWorkflowState {
            entity_type,
            entity_id: entity_id.to_string(),
            workflow_id: row.workflow_id.unwrap_or(row.step_workflow_id),
            current_step: WorkflowStep {
                id: row.step_id,
                workflow_id: row.step_workflow_id,
                status_id: row.status_id,
                step_order: row.step_order,
                is_initial_step: row.is_initial_step,
                is_final_step: row.is_final_step,
                metadata: row.metadata,
            },
            version: row.version,
        })
    }

    async fn get_step(&self, step_id: Uuid) -> StoreResult<WorkflowStep> {
        sqlx::query_as::<_, WorkflowStep>(
            r#"
            SELECT id, workflow_id, status_id, step_order, is_initial_step, is_final_step, metadata
            FROM workflow_steps
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("WorkflowStep", step_id))
    }

    async fn active_step_mapping(
        &self,
        workflow_id: Uuid,
        outcome: OutcomeType,
    ) -> StoreResult<Option<StepMapping>> {
        let row: Option<SideEffectRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, outcome_type, target_step_id, is_active, side_effects
            FROM wfm_step_mappings
            WHERE workflow_id = $1 AND outcome_type = $2 AND is_active = TRUE
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(outcome.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SideEffectRow::into_mapping).transpose()
    }

    async fn active_outcome_rule(
        &self,
        workflow_id: Uuid,
        outcome: OutcomeType,
    ) -> StoreResult<Option<OutcomeRule>> {
        let row: Option<SideEffectRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, outcome_type, NULL::uuid AS target_step_id, is_active, side_effects
            FROM wfm_outcome_rules
            WHERE workflow_id = $1 AND outcome_type = $2 AND is_active = TRUE
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(outcome.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SideEffectRow::into_outcome_rule).transpose()
    }

    async fn transition_step(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        target_step_id: Uuid,
        expected_version: i64,
    ) -> StoreResult<i64> {
        let table = entity_type.table_name();
        let version: Option<i64> = sqlx::query_scalar(&format!(
            r#"
            UPDATE {table}
            SET current_step_id = $1, version = version + 1, updated_at = NOW()
            WHERE id = $2 AND version = $3
            RETURNING version
            "#
        ))
        .bind(target_step_id)
        .bind(entity_id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(version) = version {
            return Ok(version);
        }

        let exists: bool =
            sqlx::query_scalar(&format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = $1)"))
                .bind(entity_id)
                .fetch_one(&self.pool)
                .await?;

        if exists {
            Err(StoreError::ConcurrentConflict {
                entity_type,
                entity_id: entity_id.to_string(),
                expected_version,
            })
        } else {
            Err(StoreError::not_found(entity_type.as_str(), entity_id))
        }
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn load_snapshot(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> StoreResult<EntitySnapshot> {
        let row: Option<JsonValue> = sqlx::query_scalar(&format!(
            "SELECT to_jsonb(t) FROM {} t WHERE t.id = $1",
            entity_type.table_name()
        ))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EntitySnapshot::from_value)
            .ok_or_else(|| StoreError::not_found(entity_type.as_str(), entity_id))
    }

    async fn list_snapshots(
        &self,
        entity_type: EntityType,
        limit: i64,
    ) -> StoreResult<Vec<EntitySnapshot>> {
        let rows: Vec<JsonValue> = sqlx::query_scalar(&format!(
            "SELECT to_jsonb(t) FROM {} t ORDER BY t.id LIMIT $1",
            entity_type.table_name()
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EntitySnapshot::from_value).collect())
    }

    async fn create_entity(
        &self,
        entity_type: EntityType,
        fields: &EntitySnapshot,
    ) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        // jsonb_populate_record nulls every absent column, so defaults are set here
        let mut record = fields.clone().with("id", id.clone()).with("version", 1);
        record.insert("created_at", now.clone());
        record.insert("updated_at", now);

        let table = entity_type.table_name();
        sqlx::query(&format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1)"
        ))
        .bind(record.into_value())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn link_entities(&self, link: &EntityLink) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entity_links (
                id, source_entity_type, source_entity_id, target_entity_type,
                target_entity_id, link_type, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(link.id)
        .bind(link.source_entity_type.as_str())
        .bind(&link.source_entity_id)
        .bind(link.target_entity_type.as_str())
        .bind(&link.target_entity_id)
        .bind(&link.link_type)
        .bind(link.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn users_with_role(&self, role: &str) -> StoreResult<Vec<Uuid>> {
        let users: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT ur.user_id
            FROM user_roles ur
            JOIN users u ON u.id = ur.user_id
            WHERE ur.role = $1 AND u.is_active = TRUE
            ORDER BY ur.user_id
            "#,
        )
        .bind(role)
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }
}
