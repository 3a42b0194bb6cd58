// In-memory store - every store trait over tokio locks, for tests and local runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use dealflow_shared::{
    EntitySnapshot, EntityType, EntityWorkflowState, Notification, OutcomeRule, OutcomeType,
    RuleExecution, RuleStatus, StepMapping, TriggerType, WorkflowStep,
};

use super::{
    EntityLink, EntityStore, ExecutionLog, ExecutionQuery, NotificationStore, RuleStore,
    StoreError, StoreResult, UserDirectory, WorkflowStore,
};
use crate::rules::{BusinessRule, sort_for_evaluation};

#[derive(Debug, Clone)]
struct StoredEntity {
    snapshot: EntitySnapshot,
    version: i64,
}

#[derive(Debug, Default)]
struct State {
    rules: HashMap<Uuid, BusinessRule>,
    executions: Vec<RuleExecution>,
    notifications: Vec<Notification>,
    steps: HashMap<Uuid, WorkflowStep>,
    mappings: Vec<StepMapping>,
    outcome_rules: Vec<OutcomeRule>,
    entities: HashMap<(EntityType, String), StoredEntity>,
    links: Vec<EntityLink>,
    roles: HashMap<String, Vec<Uuid>>,
}

/// Single-process store. Cheap to clone behind an `Arc`; the failure knobs
/// let tests exercise the degraded paths.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    rules_unavailable: AtomicBool,
    fail_entity_creation: AtomicBool,
    notification_delay_ms: AtomicU64,
    limit_notifications: AtomicBool,
    notification_budget: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_rule(&self, rule: BusinessRule) {
        self.state.write().await.rules.insert(rule.id, rule);
    }

    pub async fn seed_step(&self, step: WorkflowStep) {
        self.state.write().await.steps.insert(step.id, step);
    }

    pub async fn seed_mapping(&self, mapping: StepMapping) {
        self.state.write().await.mappings.push(mapping);
    }

    pub async fn seed_outcome_rule(&self, rule: OutcomeRule) {
        self.state.write().await.outcome_rules.push(rule);
    }

    /// Insert an entity at version 1. The snapshot must carry an `id`.
    pub async fn seed_entity(&self, entity_type: EntityType, snapshot: EntitySnapshot) {
        let id = snapshot.id().unwrap_or_default();
        self.state
            .write()
            .await
            .entities
            .insert((entity_type, id), StoredEntity { snapshot, version: 1 });
    }

    pub async fn seed_role(&self, role: &str, user_id: Uuid) {
        self.state
            .write()
            .await
            .roles
            .entry(role.to_string())
            .or_default()
            .push(user_id);
    }

    /// Simulate a concurrent writer bumping the entity's version.
    pub async fn touch_entity(&self, entity_type: EntityType, entity_id: &str) {
        if let Some(entity) = self
            .state
            .write()
            .await
            .entities
            .get_mut(&(entity_type, entity_id.to_string()))
        {
            entity.version += 1;
        }
    }

    pub fn set_rules_unavailable(&self, unavailable: bool) {
        self.rules_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_fail_entity_creation(&self, fail: bool) {
        self.fail_entity_creation.store(fail, Ordering::SeqCst);
    }

    /// Delay every notification write, to push rules past their timeout.
    pub fn set_notification_delay(&self, delay: Duration) {
        self.notification_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Accept only `accepted` more notification writes; later ones fail.
    pub fn fail_notifications_after(&self, accepted: u64) {
        self.notification_budget.store(accepted, Ordering::SeqCst);
        self.limit_notifications.store(true, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn executions(&self) -> Vec<RuleExecution> {
        self.state.read().await.executions.clone()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.read().await.notifications.clone()
    }

    pub async fn links(&self) -> Vec<EntityLink> {
        self.state.read().await.links.clone()
    }

    pub async fn entity(&self, entity_type: EntityType, entity_id: &str) -> Option<(EntitySnapshot, i64)> {
        self.state
            .read()
            .await
            .entities
            .get(&(entity_type, entity_id.to_string()))
            .map(|e| (e.snapshot.clone(), e.version))
    }

    pub async fn entities_of(&self, entity_type: EntityType) -> Vec<EntitySnapshot> {
        let state = self.state.read().await;
        let mut snapshots: Vec<_> = state
            .entities
            .iter()
            .filter(|((t, _), _)| *t == entity_type)
            .map(|(_, e)| e.snapshot.clone())
            .collect();
        snapshots.sort_by_key(|s| s.id());
        snapshots
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn check_rules_available(&self) -> StoreResult<()> {
        if self.rules_unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("rule store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn applicable_rules(
        &self,
        entity_type: EntityType,
        trigger_event: &str,
    ) -> StoreResult<Vec<BusinessRule>> {
        self.check_rules_available()?;
        let state = self.state.read().await;
        let mut rules: Vec<_> = state
            .rules
            .values()
            .filter(|r| r.is_active() && r.entity_type == entity_type && r.listens_to(trigger_event))
            .cloned()
            .collect();
        sort_for_evaluation(&mut rules);
        Ok(rules)
    }

    async fn scheduled_rules(&self) -> StoreResult<Vec<BusinessRule>> {
        self.check_rules_available()?;
        let state = self.state.read().await;
        let mut rules: Vec<_> = state
            .rules
            .values()
            .filter(|r| r.is_active() && r.trigger_type == TriggerType::Schedule)
            .cloned()
            .collect();
        sort_for_evaluation(&mut rules);
        Ok(rules)
    }

    async fn list_rules(
        &self,
        entity_type: Option<EntityType>,
        status: Option<RuleStatus>,
    ) -> StoreResult<Vec<BusinessRule>> {
        self.check_rules_available()?;
        let state = self.state.read().await;
        let mut rules: Vec<_> = state
            .rules
            .values()
            .filter(|r| entity_type.is_none_or(|t| r.entity_type == t))
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        sort_for_evaluation(&mut rules);
        Ok(rules)
    }

    async fn get_rule(&self, id: Uuid) -> StoreResult<BusinessRule> {
        self.check_rules_available()?;
        self.state
            .read()
            .await
            .rules
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Rule", id))
    }

    async fn insert_rule(&self, rule: &BusinessRule) -> StoreResult<()> {
        self.check_rules_available()?;
        self.state.write().await.rules.insert(rule.id, rule.clone());
        self.wrote();
        Ok(())
    }

    async fn set_rule_status(&self, id: Uuid, status: RuleStatus) -> StoreResult<BusinessRule> {
        self.check_rules_available()?;
        let mut state = self.state.write().await;
        let rule = state
            .rules
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("Rule", id))?;
        rule.status = status;
        rule.last_updated = Utc::now();
        let updated = rule.clone();
        drop(state);
        self.wrote();
        Ok(updated)
    }
}

#[async_trait]
impl ExecutionLog for InMemoryStore {
    async fn record_execution(&self, execution: &RuleExecution) -> StoreResult<()> {
        self.state.write().await.executions.push(execution.clone());
        self.wrote();
        Ok(())
    }

    async fn list_executions(&self, query: &ExecutionQuery) -> StoreResult<Vec<RuleExecution>> {
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .executions
            .iter()
            .filter(|e| query.rule_id.is_none_or(|id| e.rule_id == id))
            .filter(|e| query.entity_id.as_deref().is_none_or(|id| e.entity_id == id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        rows.truncate(query.effective_limit() as usize);
        Ok(rows)
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn create_notification(&self, notification: &Notification) -> StoreResult<()> {
        let delay = self.notification_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.limit_notifications.load(Ordering::SeqCst) {
            let remaining = self.notification_budget.load(Ordering::SeqCst);
            if remaining == 0 {
                return Err(StoreError::Unavailable(
                    "notification store rejected the write".to_string(),
                ));
            }
            self.notification_budget.store(remaining - 1, Ordering::SeqCst);
        }
        self.state
            .write()
            .await
            .notifications
            .push(notification.clone());
        self.wrote();
        Ok(())
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> StoreResult<Vec<Notification>> {
        let now = Utc::now();
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && !n.is_expired(now))
            .filter(|n| !unread_only || !n.is_read)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn mark_read(&self, id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(notification) = state
            .notifications
            .iter_mut()
            .find(|n| n.id == id && n.user_id == user_id)
        else {
            return Ok(false);
        };
        notification.is_read = true;
        drop(state);
        self.wrote();
        Ok(true)
    }

    async fn unread_count(&self, user_id: Uuid) -> StoreResult<i64> {
        let now = Utc::now();
        let state = self.state.read().await;
        Ok(state
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && !n.is_read && !n.is_expired(now))
            .count() as i64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let before = state.notifications.len();
        state.notifications.retain(|n| !n.is_expired(now));
        Ok((before - state.notifications.len()) as u64)
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn workflow_state(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> StoreResult<EntityWorkflowState> {
        let state = self.state.read().await;
        let entity = state
            .entities
            .get(&(entity_type, entity_id.to_string()))
            .ok_or_else(|| StoreError::not_found(entity_type.as_str(), entity_id))?;

        let step_id = entity
            .snapshot
            .get_uuid("current_step_id")
            .ok_or_else(|| StoreError::not_found("WorkflowState", entity_id))?;
        let current_step = state
            .steps
            .get(&step_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("WorkflowStep", step_id))?;

        Ok(EntityWorkflowState {
            entity_type,
            entity_id: entity_id.to_string(),
            workflow_id: entity
                .snapshot
                .get_uuid("workflow_id")
                .unwrap_or(current_step.workflow_id),
            current_step,
            version: entity.version,
        })
    }

    async fn get_step(&self, step_id: Uuid) -> StoreResult<WorkflowStep> {
        self.state
            .read()
            .await
            .steps
            .get(&step_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("WorkflowStep", step_id))
    }

    async fn active_step_mapping(
        &self,
        workflow_id: Uuid,
        outcome: OutcomeType,
    ) -> StoreResult<Option<StepMapping>> {
        Ok(self
            .state
            .read()
            .await
            .mappings
            .iter()
            .find(|m| m.workflow_id == workflow_id && m.outcome_type == outcome && m.is_active)
            .cloned())
    }

    async fn active_outcome_rule(
        &self,
        workflow_id: Uuid,
        outcome: OutcomeType,
    ) -> StoreResult<Option<OutcomeRule>> {
        Ok(self
            .state
            .read()
            .await
            .outcome_rules
            .iter()
            .find(|r| r.workflow_id == workflow_id && r.outcome_type == outcome && r.is_active)
            .cloned())
    }

    async fn transition_step(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        target_step_id: Uuid,
        expected_version: i64,
    ) -> StoreResult<i64> {
        let mut state = self.state.write().await;
        let entity = state
            .entities
            .get_mut(&(entity_type, entity_id.to_string()))
            .ok_or_else(|| StoreError::not_found(entity_type.as_str(), entity_id))?;

        if entity.version != expected_version {
            return Err(StoreError::ConcurrentConflict {
                entity_type,
                entity_id: entity_id.to_string(),
                expected_version,
            });
        }

        entity.snapshot.insert("current_step_id", target_step_id.to_string());
        entity.snapshot.insert("updated_at", Utc::now().to_rfc3339());
        entity.version += 1;
        let version = entity.version;
        drop(state);
        self.wrote();
        Ok(version)
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn load_snapshot(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> StoreResult<EntitySnapshot> {
        self.state
            .read()
            .await
            .entities
            .get(&(entity_type, entity_id.to_string()))
            .map(|e| e.snapshot.clone())
            .ok_or_else(|| StoreError::not_found(entity_type.as_str(), entity_id))
    }

    async fn list_snapshots(
        &self,
        entity_type: EntityType,
        limit: i64,
    ) -> StoreResult<Vec<EntitySnapshot>> {
        let mut snapshots = self.entities_of(entity_type).await;
        snapshots.truncate(limit.max(0) as usize);
        Ok(snapshots)
    }

    async fn create_entity(
        &self,
        entity_type: EntityType,
        fields: &EntitySnapshot,
    ) -> StoreResult<String> {
        if self.fail_entity_creation.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "cannot create {} entities",
                entity_type
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let mut snapshot = fields.clone().with("id", id.clone());
        snapshot.insert("created_at", now.clone());
        snapshot.insert("updated_at", now);

        self.state
            .write()
            .await
            .entities
            .insert((entity_type, id.clone()), StoredEntity { snapshot, version: 1 });
        self.wrote();
        Ok(id)
    }

    async fn link_entities(&self, link: &EntityLink) -> StoreResult<()> {
        self.state.write().await.links.push(link.clone());
        self.wrote();
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn users_with_role(&self, role: &str) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .state
            .read()
            .await
            .roles
            .get(role)
            .cloned()
            .unwrap_or_default())
    }
}
