// Business Rules - Conditions, actions, templates and the evaluation engine

pub mod actions;
pub mod conditions;
pub mod definition;
pub mod engine;
pub mod template;
pub mod triggers;

pub use actions::{
    ActionDispatcher, ActionError, ActionOutcome, DispatchReport, OWNER_FIELDS, RecipientSelector,
    RuleAction, owner_of,
};
pub use conditions::{ComparisonOperator, ConditionClause, conditions_met, presets};
pub use definition::{BusinessRule, DEFAULT_PRIORITY, sort_for_evaluation};
pub use engine::{EngineConfig, RuleEngine, ScheduledSweepSummary};
pub use template::{format_currency, format_number, substitute, unresolved_placeholders};
pub use triggers::{MutationKind, SCHEDULED_EVENT, TriggerEvent, event_name};
