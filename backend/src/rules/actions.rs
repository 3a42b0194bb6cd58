// Rule Actions - Side effects executed when a rule's conditions hold

use chrono::Utc;
use dealflow_shared::{
    ConversionSpec, EntitySnapshot, EntityType, Notification, NotificationPriority,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::template;
use super::{BusinessRule, TriggerEvent};
use crate::outcomes::{ConversionError, EntityConverter};
use crate::store::{StoreError, Stores};

/// Snapshot fields consulted, in order, when a notification falls back to the owner.
pub const OWNER_FIELDS: &[&str] = &["assigned_to_user_id", "created_by_user_id"];

fn default_notification_type() -> String {
    "business_rule".to_string()
}

/// Who receives a rule notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecipientSelector {
    /// The entity's owning user.
    #[default]
    Owner,
    User { user_id: Uuid },
    /// Every user holding the role; falls back to the owner when nobody does.
    Role { role: String },
    /// A user id stored on the snapshot; falls back to the owner when absent.
    Field { field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    Notify {
        #[serde(default)]
        recipient: RecipientSelector,
        #[serde(alias = "title")]
        title_template: String,
        #[serde(default, alias = "message")]
        message_template: String,
        #[serde(default)]
        priority: NotificationPriority,
        #[serde(default = "default_notification_type")]
        notification_type: String,
    },
    TransitionStep {
        target_step_id: Uuid,
    },
    TriggerConversion {
        target_entity_type: EntityType,
        #[serde(default)]
        field_mappings: BTreeMap<String, String>,
    },
}

impl RuleAction {
    pub fn notify(
        recipient: RecipientSelector,
        title_template: &str,
        message_template: &str,
        priority: NotificationPriority,
    ) -> Self {
        Self::Notify {
            recipient,
            title_template: title_template.to_string(),
            message_template: message_template.to_string(),
            priority,
            notification_type: default_notification_type(),
        }
    }

    pub fn transition_step(target_step_id: Uuid) -> Self {
        Self::TransitionStep { target_step_id }
    }

    pub fn trigger_conversion(target_entity_type: EntityType) -> Self {
        Self::TriggerConversion {
            target_entity_type,
            field_mappings: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Notify { .. } => "notify",
            Self::TransitionStep { .. } => "transition_step",
            Self::TriggerConversion { .. } => "trigger_conversion",
        }
    }

    pub fn validate(&self, entity_type: EntityType) -> Result<(), String> {
        match self {
            Self::Notify { title_template, .. } if title_template.trim().is_empty() => {
                Err("notify actions need a title template".to_string())
            }
            Self::TransitionStep { .. } if !entity_type.has_workflow() => Err(format!(
                "{} entities have no workflow steps to transition",
                entity_type
            )),
            Self::TriggerConversion {
                target_entity_type, ..
            } if *target_entity_type == entity_type => {
                Err(format!("cannot convert a {} into itself", entity_type))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("entity is in terminal step {step_id}; no further transitions")]
    TerminalStep { step_id: Uuid },
    #[error("step {step_id} does not belong to workflow {workflow_id}")]
    ForeignStep { step_id: Uuid, workflow_id: Uuid },
    #[error("{0} entities have no workflow")]
    NoWorkflow(EntityType),
    #[error("conversion failed: {0}")]
    Conversion(#[from] ConversionError),
}

/// What a single action did.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    NotificationsCreated(u32),
    StepTransitioned { step_id: Uuid },
    EntityConverted { entity_id: String },
    /// Nothing to do; not an error.
    Skipped(String),
}

/// Accumulates per-rule dispatch results. Survives a timeout with whatever
/// was completed before it.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub notifications_created: u32,
    pub actions_applied: u32,
    pub errors: Vec<String>,
}

pub struct ActionDispatcher {
    stores: Stores,
    converter: EntityConverter,
    notification_ttl: Option<chrono::Duration>,
}

impl ActionDispatcher {
    pub fn new(stores: Stores, notification_ttl: Option<chrono::Duration>) -> Self {
        let converter = EntityConverter::new(stores.entities.clone());
        Self {
            stores,
            converter,
            notification_ttl,
        }
    }

    /// Run every action in declared order. A failed action is recorded and the
    /// next one still runs.
    pub async fn dispatch(
        &self,
        rule: &BusinessRule,
        event: &TriggerEvent,
        report: &mut DispatchReport,
    ) {
        for (index, action) in rule.actions.iter().enumerate() {
            match self.execute_action(rule, action, event, report).await {
                Ok(ActionOutcome::Skipped(reason)) => {
                    debug!(rule_id = %rule.id, action = action.kind(), %reason, "Action skipped");
                }
                Ok(outcome) => {
                    debug!(rule_id = %rule.id, action = action.kind(), ?outcome, "Action applied");
                    report.actions_applied += 1;
                }
                Err(e) => {
                    warn!(
                        rule_id = %rule.id,
                        entity_id = %event.entity_id,
                        action = action.kind(),
                        error = %e,
                        "Rule action failed"
                    );
                    report
                        .errors
                        .push(format!("action {} ({}): {}", index + 1, action.kind(), e));
                }
            }
        }
    }

    /// Notifications are counted on `report` as each one is written, so the
    /// count stays accurate when a later write fails or the rule times out.
    pub async fn execute_action(
        &self,
        rule: &BusinessRule,
        action: &RuleAction,
        event: &TriggerEvent,
        report: &mut DispatchReport,
    ) -> Result<ActionOutcome, ActionError> {
        match action {
            RuleAction::Notify {
                recipient,
                title_template,
                message_template,
                priority,
                notification_type,
            } => {
                self.execute_notify(
                    rule,
                    event,
                    recipient,
                    title_template,
                    message_template,
                    *priority,
                    notification_type,
                    report,
                )
                .await
            }
            RuleAction::TransitionStep { target_step_id } => {
                self.execute_transition(event, *target_step_id).await
            }
            RuleAction::TriggerConversion {
                target_entity_type,
                field_mappings,
            } => {
                let spec = ConversionSpec {
                    target_entity_type: *target_entity_type,
                    field_mappings: field_mappings.clone(),
                };
                let entity_id = self
                    .converter
                    .convert(event.entity_type, &event.entity_id, &event.snapshot, &spec)
                    .await?;
                info!(
                    source = %event.entity_id,
                    target_type = %target_entity_type,
                    created = %entity_id,
                    "Rule converted entity"
                );
                Ok(ActionOutcome::EntityConverted { entity_id })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_notify(
        &self,
        rule: &BusinessRule,
        event: &TriggerEvent,
        recipient: &RecipientSelector,
        title_template: &str,
        message_template: &str,
        priority: NotificationPriority,
        notification_type: &str,
        report: &mut DispatchReport,
    ) -> Result<ActionOutcome, ActionError> {
        let recipients = self.resolve_recipients(recipient, &event.snapshot).await?;
        if recipients.is_empty() {
            return Ok(ActionOutcome::Skipped("no recipient could be determined".to_string()));
        }

        let title = template::substitute(title_template, &event.snapshot, event.entity_type);
        let message = template::substitute(message_template, &event.snapshot, event.entity_type);

        let mut unresolved =
            template::unresolved_placeholders(title_template, &event.snapshot, event.entity_type);
        unresolved.extend(template::unresolved_placeholders(
            message_template,
            &event.snapshot,
            event.entity_type,
        ));

        let created_at = Utc::now();
        let expires_at = self.notification_ttl.map(|ttl| created_at + ttl);
        let metadata = serde_json::json!({
            "rule_id": rule.id,
            "rule_name": rule.name,
            "trigger_event": event.trigger_event,
            "event_id": event.event_id,
            "unresolved_placeholders": unresolved,
        });

        let mut created = 0;
        for user_id in recipients {
            let notification = Notification {
                id: Uuid::new_v4(),
                notification_type: notification_type.to_string(),
                title: title.clone(),
                message: message.clone(),
                priority,
                user_id,
                entity_type: Some(event.entity_type),
                entity_id: Some(event.entity_id.clone()),
                rule_id: Some(rule.id),
                metadata: metadata.clone(),
                created_at,
                is_read: false,
                expires_at,
            };
            self.stores.notifications.create_notification(&notification).await?;
            report.notifications_created += 1;
            created += 1;
        }

        Ok(ActionOutcome::NotificationsCreated(created))
    }

    /// Resolve the selector, falling back to the owner when it yields nobody.
    pub async fn resolve_recipients(
        &self,
        selector: &RecipientSelector,
        snapshot: &EntitySnapshot,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut resolved = match selector {
            RecipientSelector::Owner => Vec::new(),
            RecipientSelector::User { user_id } => vec![*user_id],
            RecipientSelector::Role { role } => self.stores.users.users_with_role(role).await?,
            RecipientSelector::Field { field } => snapshot.get_uuid(field).into_iter().collect(),
        };

        if resolved.is_empty() {
            resolved.extend(owner_of(snapshot));
        }

        resolved.sort();
        resolved.dedup();
        Ok(resolved)
    }

    async fn execute_transition(
        &self,
        event: &TriggerEvent,
        target_step_id: Uuid,
    ) -> Result<ActionOutcome, ActionError> {
        if !event.entity_type.has_workflow() {
            return Err(ActionError::NoWorkflow(event.entity_type));
        }

        let state = self
            .stores
            .workflows
            .workflow_state(event.entity_type, &event.entity_id)
            .await?;

        if state.current_step.id == target_step_id {
            return Ok(ActionOutcome::Skipped("entity already at target step".to_string()));
        }

        if state.current_step.is_final_step {
            return Err(ActionError::TerminalStep {
                step_id: state.current_step.id,
            });
        }

        let target = self.stores.workflows.get_step(target_step_id).await?;
        if target.workflow_id != state.workflow_id {
            return Err(ActionError::ForeignStep {
                step_id: target.id,
                workflow_id: state.workflow_id,
            });
        }

        self.stores
            .workflows
            .transition_step(event.entity_type, &event.entity_id, target.id, state.version)
            .await?;

        info!(
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            from = %state.current_step.id,
            to = %target.id,
            "Rule transitioned workflow step"
        );

        Ok(ActionOutcome::StepTransitioned { step_id: target.id })
    }
}

/// The owning user of an entity snapshot, if any.
pub fn owner_of(snapshot: &EntitySnapshot) -> Option<Uuid> {
    OWNER_FIELDS.iter().find_map(|field| snapshot.get_uuid(field))
}
