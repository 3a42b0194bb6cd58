// Business Rule definitions - declarative conditions + actions targeted at one entity type

use chrono::{DateTime, Utc};
use dealflow_shared::{EntityType, RuleStatus, TriggerType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ConditionClause, RuleAction};
use crate::error::{AppError, ValidationBuilder};

pub const DEFAULT_PRIORITY: i32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRule {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub entity_type: EntityType,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_events: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionClause>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    pub status: RuleStatus,
    /// Lower runs first; ties break on id.
    pub priority: i32,
    pub last_updated: DateTime<Utc>,
}

impl BusinessRule {
    pub fn new(name: &str, entity_type: EntityType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            entity_type,
            trigger_type: TriggerType::Event,
            trigger_events: Vec::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
            status: RuleStatus::Active,
            priority: DEFAULT_PRIORITY,
            last_updated: Utc::now(),
        }
    }

    pub fn on_event(mut self, event: &str) -> Self {
        self.trigger_events.push(event.to_string());
        self
    }

    pub fn scheduled(mut self) -> Self {
        self.trigger_type = TriggerType::Schedule;
        self
    }

    pub fn when(mut self, clause: ConditionClause) -> Self {
        self.conditions.push(clause);
        self
    }

    pub fn then(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.status = RuleStatus::Inactive;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    pub fn listens_to(&self, trigger_event: &str) -> bool {
        self.trigger_events.iter().any(|e| e == trigger_event)
    }

    /// Check the definition invariants before it is stored.
    pub fn validate(&self) -> Result<(), AppError> {
        let mut errors = ValidationBuilder::new();

        if self.name.trim().is_empty() {
            errors = errors.error("name", "Rule name is required");
        }

        if self.trigger_type == TriggerType::Event && self.trigger_events.is_empty() {
            errors = errors.error("trigger_events", "Event rules need at least one trigger event");
        }

        if self.trigger_events.iter().any(|e| e.trim().is_empty()) {
            errors = errors.error("trigger_events", "Trigger event names cannot be blank");
        }

        for clause in &self.conditions {
            if !self.entity_type.has_field(clause.field()) {
                errors = errors.error(
                    "conditions",
                    &format!(
                        "Field '{}' is not part of the {} snapshot",
                        clause.field(),
                        self.entity_type
                    ),
                );
            }
        }

        if self.actions.is_empty() {
            errors = errors.error("actions", "Rules need at least one action");
        }

        for action in &self.actions {
            if let Err(message) = action.validate(self.entity_type) {
                errors = errors.error("actions", &message);
            }
        }

        match errors.build() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Deterministic evaluation order: priority ascending, then id ascending.
pub fn sort_for_evaluation(rules: &mut [BusinessRule]) {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
}
