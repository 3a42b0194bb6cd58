// Entity Conversion - Builds a linked entity of another type from a source snapshot

use chrono::Utc;
use dealflow_shared::{ConversionSpec, EntitySnapshot, EntityType};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{EntityLink, EntityStore, StoreError};

pub const CONVERTED_TO_LINK: &str = "CONVERTED_TO";

/// Fields owned by the persistence layer; never copied between entities.
const SYSTEM_FIELDS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "workflow_id",
    "current_step_id",
    "status",
    "converted_from_entity_id",
    "converted_from_entity_type",
];

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("cannot convert a {0} into itself")]
    SameType(EntityType),
    #[error("no {source_type} fields map onto a {target_type}")]
    NothingToCopy {
        source_type: EntityType,
        target_type: EntityType,
    },
    #[error("field '{field}' is not part of the {target_type} schema")]
    UnknownTargetField {
        field: String,
        target_type: EntityType,
    },
    #[error("created {target_type} {created_id} but could not link it: {source}")]
    Link {
        target_type: EntityType,
        created_id: String,
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Default source -> target field mapping for a type pair.
pub fn default_field_mappings(source: EntityType, target: EntityType) -> BTreeMap<String, String> {
    let pairs: &[(&str, &str)] = match (source, target) {
        (EntityType::Deal, EntityType::Lead) => &[
            ("name", "name"),
            ("amount", "estimated_value"),
            ("expected_close_date", "estimated_close_date"),
            ("person_id", "person_id"),
            ("organization_id", "organization_id"),
            ("assigned_to_user_id", "assigned_to_user_id"),
            ("created_by_user_id", "created_by_user_id"),
        ],
        (EntityType::Lead, EntityType::Deal) => &[
            ("name", "name"),
            ("estimated_value", "amount"),
            ("estimated_close_date", "expected_close_date"),
            ("person_id", "person_id"),
            ("organization_id", "organization_id"),
            ("assigned_to_user_id", "assigned_to_user_id"),
            ("created_by_user_id", "created_by_user_id"),
        ],
        (EntityType::Lead, EntityType::Person) => &[
            ("contact_name", "first_name"),
            ("contact_email", "email"),
            ("contact_phone", "phone"),
            ("organization_id", "organization_id"),
            ("assigned_to_user_id", "assigned_to_user_id"),
            ("created_by_user_id", "created_by_user_id"),
        ],
        (EntityType::Lead, EntityType::Organization) => &[
            ("company_name", "name"),
            ("assigned_to_user_id", "assigned_to_user_id"),
            ("created_by_user_id", "created_by_user_id"),
        ],
        _ => {
            return source
                .snapshot_fields()
                .iter()
                .filter(|field| !SYSTEM_FIELDS.contains(field) && target.has_field(field))
                .map(|field| (field.to_string(), field.to_string()))
                .collect();
        }
    };

    pairs
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect()
}

pub struct EntityConverter {
    entities: Arc<dyn EntityStore>,
}

impl EntityConverter {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }

    /// Create the target entity, link it to the source and return its id.
    pub async fn convert(
        &self,
        source_type: EntityType,
        source_id: &str,
        snapshot: &EntitySnapshot,
        spec: &ConversionSpec,
    ) -> Result<String, ConversionError> {
        let target_type = spec.target_entity_type;
        let fields = build_target(source_type, source_id, snapshot, spec)?;

        let created_id = self.entities.create_entity(target_type, &fields).await?;

        let link = EntityLink {
            id: Uuid::new_v4(),
            source_entity_type: source_type,
            source_entity_id: source_id.to_string(),
            target_entity_type: target_type,
            target_entity_id: created_id.clone(),
            link_type: CONVERTED_TO_LINK.to_string(),
            created_at: Utc::now(),
        };

        if let Err(source) = self.entities.link_entities(&link).await {
            warn!(
                source_id = %source_id,
                created_id = %created_id,
                error = %source,
                "Converted entity created but link failed"
            );
            return Err(ConversionError::Link {
                target_type,
                created_id,
                source,
            });
        }

        info!(
            source_type = %source_type,
            source_id = %source_id,
            target_type = %target_type,
            created_id = %created_id,
            "Entity converted"
        );

        Ok(created_id)
    }
}

/// Field values for the new entity, before it is persisted.
pub fn build_target(
    source_type: EntityType,
    source_id: &str,
    snapshot: &EntitySnapshot,
    spec: &ConversionSpec,
) -> Result<EntitySnapshot, ConversionError> {
    let target_type = spec.target_entity_type;
    if target_type == source_type {
        return Err(ConversionError::SameType(source_type));
    }

    let mappings = if spec.field_mappings.is_empty() {
        default_field_mappings(source_type, target_type)
    } else {
        spec.field_mappings.clone()
    };

    let mut target = EntitySnapshot::new();
    for (from, to) in &mappings {
        if SYSTEM_FIELDS.contains(&to.as_str()) {
            continue;
        }
        if !target_type.has_field(to) {
            return Err(ConversionError::UnknownTargetField {
                field: to.clone(),
                target_type,
            });
        }
        if let Some(value) = snapshot.get(from) {
            target.insert(to, value.clone());
        }
    }

    if target.fields().is_empty() {
        return Err(ConversionError::NothingToCopy {
            source_type,
            target_type,
        });
    }

    if target_type.has_field("converted_from_entity_id") {
        target.insert("converted_from_entity_id", Value::String(source_id.to_string()));
        target.insert("converted_from_entity_type", source_type.as_str());
    }

    Ok(target)
}
