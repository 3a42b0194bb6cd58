// Rule Triggers - Entity mutation events that start a rule evaluation pass

use chrono::{DateTime, Utc};
use dealflow_shared::{ChangeDelta, EntitySnapshot, EntityType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trigger event used by the scheduled rule sweep.
pub const SCHEDULED_EVENT: &str = "SCHEDULED";

/// Kind of mutation that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Created,
    Updated,
    Deleted,
    StepChanged,
}

impl MutationKind {
    fn suffix(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Deleted => "DELETED",
            Self::StepChanged => "STEP_CHANGED",
        }
    }
}

/// Canonical event name, e.g. `DEAL_UPDATED`.
pub fn event_name(entity_type: EntityType, kind: MutationKind) -> String {
    format!("{}_{}", entity_type.as_str(), kind.suffix())
}

/// An entity mutation the rules engine reacts to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub trigger_event: String,
    pub snapshot: EntitySnapshot,
    #[serde(default)]
    pub delta: ChangeDelta,
    pub occurred_at: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(
        entity_type: EntityType,
        entity_id: &str,
        trigger_event: &str,
        snapshot: EntitySnapshot,
        delta: ChangeDelta,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            entity_type,
            entity_id: entity_id.to_string(),
            trigger_event: trigger_event.to_string(),
            snapshot,
            delta,
            occurred_at: Utc::now(),
        }
    }

    /// Creation event: the delta is always empty.
    pub fn created(entity_type: EntityType, snapshot: EntitySnapshot) -> Self {
        let entity_id = snapshot.id().unwrap_or_default();
        Self::new(
            entity_type,
            &entity_id,
            &event_name(entity_type, MutationKind::Created),
            snapshot,
            ChangeDelta::new(),
        )
    }

    /// Update event with the delta computed from the two snapshots.
    pub fn updated(entity_type: EntityType, before: &EntitySnapshot, after: EntitySnapshot) -> Self {
        let entity_id = after.id().or_else(|| before.id()).unwrap_or_default();
        let delta = ChangeDelta::between(before, &after);
        Self::new(
            entity_type,
            &entity_id,
            &event_name(entity_type, MutationKind::Updated),
            after,
            delta,
        )
    }

    pub fn scheduled(entity_type: EntityType, snapshot: EntitySnapshot) -> Self {
        let entity_id = snapshot.id().unwrap_or_default();
        Self::new(entity_type, &entity_id, SCHEDULED_EVENT, snapshot, ChangeDelta::new())
    }
}
