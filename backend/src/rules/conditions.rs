// Rule Conditions - Declarative clauses evaluated against a snapshot and change delta

use dealflow_shared::{ChangeDelta, EntitySnapshot, coerce_decimal};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison used by field-threshold clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "==", alias = "equals", alias = "eq", alias = "=")]
    Equals,
    #[serde(rename = "!=", alias = "not_equals", alias = "ne")]
    NotEquals,
    #[serde(rename = ">", alias = "greater_than", alias = "gt")]
    GreaterThan,
    #[serde(rename = ">=", alias = "greater_than_or_equals", alias = "gte")]
    GreaterThanOrEquals,
    #[serde(rename = "<", alias = "less_than", alias = "lt")]
    LessThan,
    #[serde(rename = "<=", alias = "less_than_or_equals", alias = "lte")]
    LessThanOrEquals,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "in")]
    In,
}

impl ComparisonOperator {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::GreaterThan | Self::GreaterThanOrEquals | Self::LessThan | Self::LessThanOrEquals
        )
    }
}

/// A single predicate. A rule matches only when all of its clauses hold.
///
/// Stored as `{"kind": "field_threshold", "field": ..., "op": ..., "value": ...}`;
/// a bare `{"field", "op", "value"}` object is read as a field threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", from = "ClauseRepr")]
pub enum ConditionClause {
    FieldThreshold {
        field: String,
        op: ComparisonOperator,
        value: Value,
    },
    /// True iff the change delta contains the field.
    FieldChanged { field: String },
    /// True iff the field changed and its new value equals `value`.
    FieldChangedTo { field: String, value: Value },
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TaggedClause {
    FieldThreshold {
        field: String,
        #[serde(alias = "operator")]
        op: ComparisonOperator,
        value: Value,
    },
    FieldChanged {
        field: String,
    },
    FieldChangedTo {
        field: String,
        value: Value,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClauseRepr {
    Tagged(TaggedClause),
    Bare {
        field: String,
        #[serde(alias = "operator")]
        op: ComparisonOperator,
        value: Value,
    },
}

impl From<ClauseRepr> for ConditionClause {
    fn from(repr: ClauseRepr) -> Self {
        match repr {
            ClauseRepr::Tagged(TaggedClause::FieldThreshold { field, op, value })
            | ClauseRepr::Bare { field, op, value } => Self::FieldThreshold { field, op, value },
            ClauseRepr::Tagged(TaggedClause::FieldChanged { field }) => Self::FieldChanged { field },
            ClauseRepr::Tagged(TaggedClause::FieldChangedTo { field, value }) => {
                Self::FieldChangedTo { field, value }
            }
        }
    }
}

impl ConditionClause {
    pub fn threshold(field: &str, op: ComparisonOperator, value: Value) -> Self {
        Self::FieldThreshold {
            field: field.to_string(),
            op,
            value,
        }
    }

    pub fn equals(field: &str, value: Value) -> Self {
        Self::threshold(field, ComparisonOperator::Equals, value)
    }

    pub fn at_least(field: &str, value: impl Into<Value>) -> Self {
        Self::threshold(field, ComparisonOperator::GreaterThanOrEquals, value.into())
    }

    pub fn below(field: &str, value: impl Into<Value>) -> Self {
        Self::threshold(field, ComparisonOperator::LessThan, value.into())
    }

    pub fn changed(field: &str) -> Self {
        Self::FieldChanged {
            field: field.to_string(),
        }
    }

    pub fn changed_to(field: &str, value: impl Into<Value>) -> Self {
        Self::FieldChangedTo {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Self::FieldThreshold { field, .. }
            | Self::FieldChanged { field }
            | Self::FieldChangedTo { field, .. } => field,
        }
    }

    /// Absent fields make the clause false; evaluation never fails.
    pub fn evaluate(&self, snapshot: &EntitySnapshot, delta: &ChangeDelta) -> bool {
        match self {
            Self::FieldThreshold { field, op, value } => match snapshot.get(field) {
                Some(actual) => compare(*op, actual, value),
                None => false,
            },
            Self::FieldChanged { field } => delta.contains(field),
            Self::FieldChangedTo { field, value } => delta
                .get(field)
                .map(|change| values_equal(&change.new, value))
                .unwrap_or(false),
        }
    }
}

/// Logical AND over every clause; an empty list is vacuously true.
pub fn conditions_met(
    clauses: &[ConditionClause],
    snapshot: &EntitySnapshot,
    delta: &ChangeDelta,
) -> bool {
    clauses.iter().all(|clause| clause.evaluate(snapshot, delta))
}

fn compare(op: ComparisonOperator, actual: &Value, expected: &Value) -> bool {
    match op {
        ComparisonOperator::Equals => values_equal(actual, expected),
        ComparisonOperator::NotEquals => !values_equal(actual, expected),
        ComparisonOperator::GreaterThan
        | ComparisonOperator::GreaterThanOrEquals
        | ComparisonOperator::LessThan
        | ComparisonOperator::LessThanOrEquals => {
            let (Some(a), Some(b)) = (coerce_decimal(actual), coerce_decimal(expected)) else {
                return false;
            };
            match op {
                ComparisonOperator::GreaterThan => a > b,
                ComparisonOperator::GreaterThanOrEquals => a >= b,
                ComparisonOperator::LessThan => a < b,
                _ => a <= b,
            }
        }
        ComparisonOperator::Contains => match actual {
            Value::String(s) => expected
                .as_str()
                .map(|needle| s.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false),
            Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
            _ => false,
        },
        ComparisonOperator::In => expected
            .as_array()
            .map(|candidates| candidates.iter().any(|c| values_equal(actual, c)))
            .unwrap_or(false),
    }
}

/// JSON equality, widened so that string-encoded numbers match numbers.
fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (coerce_decimal(a), coerce_decimal(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Common clause presets for CRM rules
pub mod presets {
    use super::*;

    pub fn high_value_deal(threshold: i64) -> ConditionClause {
        ConditionClause::at_least("amount", threshold)
    }

    pub fn owner_changed() -> ConditionClause {
        ConditionClause::changed("assigned_to_user_id")
    }

    pub fn amount_changed() -> ConditionClause {
        ConditionClause::changed("amount")
    }

    pub fn status_changed_to(status: &str) -> ConditionClause {
        ConditionClause::changed_to("status", serde_json::json!(status))
    }

    pub fn lead_score_at_least(score: i64) -> ConditionClause {
        ConditionClause::at_least("lead_score", score)
    }
}
