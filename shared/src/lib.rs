use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// CRM entity kinds the rules engine can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Deal,
    Lead,
    Person,
    Organization,
    Activity,
}

const DEAL_FIELDS: &[&str] = &[
    "id", "name", "amount", "currency", "expected_close_date", "probability",
    "person_id", "organization_id", "assigned_to_user_id", "created_by_user_id",
    "workflow_id", "current_step_id", "stage", "status", "source", "created_at", "updated_at",
];

const LEAD_FIELDS: &[&str] = &[
    "id", "name", "contact_name", "contact_email", "contact_phone", "company_name",
    "estimated_value", "estimated_close_date", "lead_score", "lead_source", "person_id",
    "organization_id", "assigned_to_user_id", "created_by_user_id", "workflow_id",
    "current_step_id", "status", "converted_from_entity_id", "converted_from_entity_type",
    "created_at", "updated_at",
];

const PERSON_FIELDS: &[&str] = &[
    "id", "first_name", "last_name", "email", "phone", "organization_id",
    "assigned_to_user_id", "created_by_user_id", "status", "created_at", "updated_at",
];

const ORGANIZATION_FIELDS: &[&str] = &[
    "id", "name", "industry", "website", "address", "assigned_to_user_id",
    "created_by_user_id", "status", "created_at", "updated_at",
];

const ACTIVITY_FIELDS: &[&str] = &[
    "id", "subject", "activity_type", "due_date", "is_done", "deal_id", "lead_id",
    "person_id", "organization_id", "assigned_to_user_id", "created_by_user_id",
    "status", "created_at", "updated_at",
];

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Deal,
        EntityType::Lead,
        EntityType::Person,
        EntityType::Organization,
        EntityType::Activity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deal => "DEAL",
            Self::Lead => "LEAD",
            Self::Person => "PERSON",
            Self::Organization => "ORGANIZATION",
            Self::Activity => "ACTIVITY",
        }
    }

    /// Lowercase prefix used by template placeholders such as `{{deal_name}}`.
    pub fn placeholder_prefix(&self) -> &'static str {
        match self {
            Self::Deal => "deal",
            Self::Lead => "lead",
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Activity => "activity",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Deal => "deals",
            Self::Lead => "leads",
            Self::Person => "people",
            Self::Organization => "organizations",
            Self::Activity => "activities",
        }
    }

    /// Fields a snapshot of this entity type may carry.
    pub fn snapshot_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Deal => DEAL_FIELDS,
            Self::Lead => LEAD_FIELDS,
            Self::Person => PERSON_FIELDS,
            Self::Organization => ORGANIZATION_FIELDS,
            Self::Activity => ACTIVITY_FIELDS,
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        // Nested paths are validated on their root segment
        let root = field.split('.').next().unwrap_or(field);
        self.snapshot_fields().contains(&root)
    }

    /// Only deals and leads run through workflow steps.
    pub fn has_workflow(&self) -> bool {
        matches!(self, Self::Deal | Self::Lead)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEAL" => Ok(Self::Deal),
            "LEAD" => Ok(Self::Lead),
            "PERSON" => Ok(Self::Person),
            "ORGANIZATION" => Ok(Self::Organization),
            "ACTIVITY" => Ok(Self::Activity),
            other => Err(format!("unknown entity type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Event,
    Schedule,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "EVENT",
            Self::Schedule => "SCHEDULE",
        }
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EVENT" => Ok(Self::Event),
            "SCHEDULE" => Ok(Self::Schedule),
            other => Err(format!("unknown trigger type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    Active,
    Inactive,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
        }
    }
}

impl FromStr for RuleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "INACTIVE" => Ok(Self::Inactive),
            other => Err(format!("unknown rule status: {}", other)),
        }
    }
}

/// Coerce a JSON value into a decimal. Strings are parsed, so `"95000"` and
/// `95000` compare equal; anything else is not a number.
pub fn coerce_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else if let Some(u) = n.as_u64() {
                Some(Decimal::from(u))
            } else {
                Decimal::from_str(&n.to_string())
                    .ok()
                    .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok()))
            }
        }
        Value::String(s) => {
            let trimmed = s.trim().replace(',', "");
            if trimmed.is_empty() {
                return None;
            }
            Decimal::from_str(&trimmed)
                .ok()
                .or_else(|| Decimal::from_scientific(&trimmed).ok())
        }
        _ => None,
    }
}

/// Point-in-time field values of the entity that triggered an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntitySnapshot {
    fields: Map<String, Value>,
}

impl EntitySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Builds a snapshot from a JSON object; any other value yields an empty snapshot.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    /// The entity id, rendered as a string whether stored as text or number.
    pub fn id(&self) -> Option<String> {
        match self.fields.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Looks up a field, following dot notation into nested objects.
    /// JSON `null` is treated the same as an absent field.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = current.get(part)?;
        }
        if current.is_null() { None } else { Some(current) }
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn get_uuid(&self, path: &str) -> Option<Uuid> {
        self.get_str(path).and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Old and new value of one changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    #[serde(default)]
    pub old: Value,
    #[serde(default)]
    pub new: Value,
}

impl FieldChange {
    pub fn new(old: impl Into<Value>, new: impl Into<Value>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }
}

/// Fields that changed in the triggering mutation. Empty on creation events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeDelta {
    changes: BTreeMap<String, FieldChange>,
}

impl ChangeDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff two snapshots. Fields present on only one side count as changed.
    pub fn between(old: &EntitySnapshot, new: &EntitySnapshot) -> Self {
        let mut changes = BTreeMap::new();

        for (field, new_value) in new.fields() {
            let old_value = old.fields().get(field).cloned().unwrap_or(Value::Null);
            if &old_value != new_value {
                changes.insert(field.clone(), FieldChange::new(old_value, new_value.clone()));
            }
        }

        for (field, old_value) in old.fields() {
            if !new.fields().contains_key(field) && !old_value.is_null() {
                changes.insert(field.clone(), FieldChange::new(old_value.clone(), Value::Null));
            }
        }

        Self { changes }
    }

    pub fn with_change(mut self, field: &str, old: impl Into<Value>, new: impl Into<Value>) -> Self {
        self.changes.insert(field.to_string(), FieldChange::new(old, new));
        self
    }

    pub fn insert(&mut self, field: &str, change: FieldChange) {
        self.changes.insert(field.to_string(), change);
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.changes.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.changes.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.changes.keys()
    }
}

/// Audit outcome of one rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Conditions were not met; no actions ran.
    Skipped,
    Succeeded,
    /// At least one action failed; the others still ran.
    PartialFailure,
    TimedOut,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "SKIPPED",
            Self::Succeeded => "SUCCEEDED",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SKIPPED" => Ok(Self::Skipped),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "PARTIAL_FAILURE" => Ok(Self::PartialFailure),
            "TIMED_OUT" => Ok(Self::TimedOut),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// Append-only audit row: one per (rule, triggering event) evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExecution {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub execution_trigger: String,
    pub conditions_met: bool,
    pub execution_time_ms: i64,
    pub notifications_created: i32,
    pub status: ExecutionStatus,
    pub errors: Vec<String>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Urgent => "URGENT",
        }
    }
}

impl FromStr for NotificationPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "NORMAL" | "MEDIUM" => Ok(Self::Normal),
            "HIGH" => Ok(Self::High),
            "URGENT" | "CRITICAL" => Ok(Self::Urgent),
            other => Err(format!("unknown notification priority: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub user_id: Uuid,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub rule_id: Option<Uuid>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status_id: Uuid,
    pub step_order: i32,
    pub is_initial_step: bool,
    pub is_final_step: bool,
    pub metadata: Value,
}

/// An entity's position in its workflow, read for outcome validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityWorkflowState {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub workflow_id: Uuid,
    pub current_step: WorkflowStep,
    /// Row version used for optimistic concurrency on step updates.
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeType {
    Won,
    Lost,
    Converted,
}

impl OutcomeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Won => "WON",
            Self::Lost => "LOST",
            Self::Converted => "CONVERTED",
        }
    }
}

impl fmt::Display for OutcomeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WON" => Ok(Self::Won),
            "LOST" => Ok(Self::Lost),
            "CONVERTED" => Ok(Self::Converted),
            other => Err(format!("unknown outcome: {}", other)),
        }
    }
}

/// How to build the target entity when converting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionSpec {
    pub target_entity_type: EntityType,
    /// source field -> target field. Empty means the default mapping for the type pair.
    #[serde(default)]
    pub field_mappings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSideEffects {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_conversion: Option<ConversionSpec>,
}

/// Resolves an outcome on a workflow to the step it lands on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMapping {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub outcome_type: OutcomeType,
    pub target_step_id: Uuid,
    pub is_active: bool,
    #[serde(default)]
    pub side_effects: OutcomeSideEffects,
}

/// Workflow-level side effects attached to an outcome independent of the mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRule {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub outcome_type: OutcomeType,
    pub is_active: bool,
    #[serde(default)]
    pub side_effects: OutcomeSideEffects,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WfmOutcomeExecutionRequest {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub outcome: OutcomeType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideEffectResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_entity_type: Option<EntityType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SideEffectResult {
    pub fn converted(target: EntityType, created_entity_id: String) -> Self {
        Self {
            success: true,
            target_entity_type: Some(target),
            created_entity_id: Some(created_entity_id),
            error: None,
        }
    }

    pub fn failed(target: EntityType, error: impl Into<String>) -> Self {
        Self {
            success: false,
            target_entity_type: Some(target),
            created_entity_id: None,
            error: Some(error.into()),
        }
    }
}

/// Result of one `process_business_rules` pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleProcessingSummary {
    pub rules_evaluated: u32,
    pub notifications_created: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideEffectsApplied {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_conversion: Option<SideEffectResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_rules: Option<RuleProcessingSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WfmOutcomeExecutionResult {
    pub success: bool,
    pub outcome_executed: bool,
    pub target_step_id: Option<Uuid>,
    pub side_effects_applied: SideEffectsApplied,
    pub errors: Vec<String>,
}

impl WfmOutcomeExecutionResult {
    /// A rejection made before any write.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            outcome_executed: false,
            target_step_id: None,
            side_effects_applied: SideEffectsApplied::default(),
            errors: vec![error.into()],
        }
    }
}
