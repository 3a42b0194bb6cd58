// Rule Engine - Evaluates applicable rules for an entity mutation and records the audit trail

use chrono::{DateTime, Utc};
use dealflow_shared::{
    ChangeDelta, EntitySnapshot, EntityType, ExecutionStatus, RuleExecution, RuleProcessingSummary,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ActionDispatcher, BusinessRule, DispatchReport, TriggerEvent, conditions};
use crate::store::Stores;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on one rule's action dispatch.
    pub rule_timeout: Duration,
    /// Default lifetime of rule notifications.
    pub notification_ttl: Option<chrono::Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rule_timeout: Duration::from_secs(5),
            notification_ttl: None,
        }
    }
}

/// Result of a SCHEDULE-rule sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledSweepSummary {
    pub rules_loaded: u32,
    pub entities_scanned: u32,
    pub rules_evaluated: u32,
    pub notifications_created: u32,
    pub errors: Vec<String>,
}

/// Hands out audit timestamps that never go backwards within one batch.
#[derive(Debug, Default)]
struct AuditClock {
    last: Option<DateTime<Utc>>,
}

impl AuditClock {
    fn next(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

pub struct RuleEngine {
    stores: Stores,
    dispatcher: ActionDispatcher,
    config: EngineConfig,
}

impl RuleEngine {
    pub fn new(stores: Stores, config: EngineConfig) -> Self {
        let dispatcher = ActionDispatcher::new(stores.clone(), config.notification_ttl);
        Self {
            stores,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Inbound trigger called after a successful entity write. Never fails:
    /// problems are reported in the summary and the audit log.
    pub async fn process_business_rules(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        trigger_event: &str,
        snapshot: EntitySnapshot,
        delta: ChangeDelta,
    ) -> RuleProcessingSummary {
        let event = TriggerEvent::new(entity_type, entity_id, trigger_event, snapshot, delta);
        self.process_event(&event).await
    }

    pub async fn process_event(&self, event: &TriggerEvent) -> RuleProcessingSummary {
        let rules = match self
            .stores
            .rules
            .applicable_rules(event.entity_type, &event.trigger_event)
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                error!(
                    entity_type = %event.entity_type,
                    entity_id = %event.entity_id,
                    trigger = %event.trigger_event,
                    error = %e,
                    "Rule store unavailable; no rules applied"
                );
                return RuleProcessingSummary {
                    errors: vec![format!("rule store unavailable: {}", e)],
                    ..RuleProcessingSummary::default()
                };
            }
        };

        info!(
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            trigger = %event.trigger_event,
            rules = rules.len(),
            "Processing business rules"
        );

        self.evaluate_rules(&rules, event).await
    }

    /// Evaluate rules in order and write one audit row per rule.
    async fn evaluate_rules(
        &self,
        rules: &[BusinessRule],
        event: &TriggerEvent,
    ) -> RuleProcessingSummary {
        let mut summary = RuleProcessingSummary::default();
        let mut clock = AuditClock::default();

        for rule in rules {
            if !rule.is_active() || rule.entity_type != event.entity_type {
                continue;
            }

            let execution = self.evaluate_rule(rule, event, &mut clock).await;

            summary.rules_evaluated += 1;
            summary.notifications_created += execution.notifications_created.max(0) as u32;
            summary.errors.extend(
                execution
                    .errors
                    .iter()
                    .map(|e| format!("rule '{}': {}", rule.name, e)),
            );

            if let Err(e) = self.stores.executions.record_execution(&execution).await {
                error!(rule_id = %rule.id, error = %e, "Failed to record rule execution");
                summary
                    .errors
                    .push(format!("rule '{}': audit write failed: {}", rule.name, e));
            }
        }

        summary
    }

    async fn evaluate_rule(
        &self,
        rule: &BusinessRule,
        event: &TriggerEvent,
        clock: &mut AuditClock,
    ) -> RuleExecution {
        let conditions_met = conditions::conditions_met(&rule.conditions, &event.snapshot, &event.delta);
        let mut report = DispatchReport::default();
        let started = Instant::now();

        let status = if !conditions_met {
            ExecutionStatus::Skipped
        } else {
            let dispatch = self.dispatcher.dispatch(rule, event, &mut report);
            match tokio::time::timeout(self.config.rule_timeout, dispatch).await {
                Ok(()) if report.errors.is_empty() => ExecutionStatus::Succeeded,
                Ok(()) => ExecutionStatus::PartialFailure,
                Err(_) => {
                    warn!(
                        rule_id = %rule.id,
                        entity_id = %event.entity_id,
                        timeout_ms = self.config.rule_timeout.as_millis() as u64,
                        "Rule timed out"
                    );
                    report.errors.push(format!(
                        "timed out after {}ms",
                        self.config.rule_timeout.as_millis()
                    ));
                    ExecutionStatus::TimedOut
                }
            }
        };

        let execution_time_ms = if conditions_met {
            started.elapsed().as_millis() as i64
        } else {
            0
        };

        debug!(
            rule_id = %rule.id,
            rule = %rule.name,
            conditions_met,
            status = status.as_str(),
            notifications = report.notifications_created,
            "Rule evaluated"
        );

        RuleExecution {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            entity_type: event.entity_type,
            entity_id: event.entity_id.clone(),
            execution_trigger: event.trigger_event.clone(),
            conditions_met,
            execution_time_ms,
            notifications_created: report.notifications_created as i32,
            status,
            errors: report.errors,
            executed_at: clock.next(),
        }
    }

    /// Evaluate every ACTIVE SCHEDULE rule against a batch of current entities.
    pub async fn run_scheduled_rules(&self, batch_size: i64) -> ScheduledSweepSummary {
        let mut sweep = ScheduledSweepSummary::default();

        let rules = match self.stores.rules.scheduled_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                error!(error = %e, "Rule store unavailable; scheduled sweep skipped");
                sweep.errors.push(format!("rule store unavailable: {}", e));
                return sweep;
            }
        };
        sweep.rules_loaded = rules.len() as u32;

        let mut by_type: BTreeMap<EntityType, Vec<BusinessRule>> = BTreeMap::new();
        for rule in rules {
            by_type.entry(rule.entity_type).or_default().push(rule);
        }

        for (entity_type, rules) in by_type {
            let snapshots = match self.stores.entities.list_snapshots(entity_type, batch_size).await {
                Ok(snapshots) => snapshots,
                Err(e) => {
                    error!(entity_type = %entity_type, error = %e, "Failed to load entities for scheduled rules");
                    sweep
                        .errors
                        .push(format!("{}: failed to load entities: {}", entity_type, e));
                    continue;
                }
            };

            for snapshot in snapshots {
                let event = TriggerEvent::scheduled(entity_type, snapshot);
                if event.entity_id.is_empty() {
                    continue;
                }
                sweep.entities_scanned += 1;

                let summary = self.evaluate_rules(&rules, &event).await;
                sweep.rules_evaluated += summary.rules_evaluated;
                sweep.notifications_created += summary.notifications_created;
                sweep.errors.extend(summary.errors);
            }
        }

        info!(
            rules = sweep.rules_loaded,
            entities = sweep.entities_scanned,
            notifications = sweep.notifications_created,
            errors = sweep.errors.len(),
            "Scheduled rule sweep finished"
        );

        sweep
    }
}
