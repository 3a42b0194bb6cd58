// Workflow Outcome Executor - Validates and applies WON/LOST/CONVERTED outcomes
//
// Validation failures return before any write. Once the step transition is
// committed it is authoritative: conversion and the follow-up rule pass only
// report their own results.

use dealflow_shared::{
    ChangeDelta, ConversionSpec, EntityType, EntityWorkflowState, OutcomeType, SideEffectResult,
    StepMapping, WfmOutcomeExecutionRequest, WfmOutcomeExecutionResult,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::EntityConverter;
use crate::rules::{MutationKind, RuleEngine, event_name};
use crate::store::{StoreError, Stores};

pub const TERMINAL_STATE_ERROR: &str = "entity already in terminal state";
pub const OUTCOME_UNAVAILABLE_ERROR: &str = "outcome not available for this workflow";

/// Why an outcome request was rejected before any write.
#[derive(Debug, thiserror::Error)]
pub enum OutcomeRejection {
    #[error("{0} entities have no workflow")]
    NoWorkflow(EntityType),
    #[error("{entity_type} {entity_id} not found")]
    NotFound {
        entity_type: EntityType,
        entity_id: String,
    },
    #[error("entity already in terminal state")]
    AlreadyTerminal,
    #[error("outcome not available for this workflow")]
    OutcomeUnavailable,
    #[error("target step {0} does not belong to the entity's workflow")]
    ForeignTargetStep(Uuid),
    #[error("entity was modified concurrently; reload and retry")]
    Conflict,
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for OutcomeRejection {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrentConflict { .. } => Self::Conflict,
            other => Self::Store(other),
        }
    }
}

/// The validated plan for one outcome, computed before any write.
struct OutcomePlan {
    state: EntityWorkflowState,
    mapping: StepMapping,
}

pub struct WfmOutcomeExecutor {
    stores: Stores,
    converter: EntityConverter,
    rule_engine: Option<Arc<RuleEngine>>,
}

impl WfmOutcomeExecutor {
    pub fn new(stores: Stores) -> Self {
        let converter = EntityConverter::new(stores.entities.clone());
        Self {
            stores,
            converter,
            rule_engine: None,
        }
    }

    /// Run a `<ENTITY>_STEP_CHANGED` rule pass after every committed outcome.
    pub fn with_rule_engine(mut self, engine: Arc<RuleEngine>) -> Self {
        self.rule_engine = Some(engine);
        self
    }

    pub async fn execute(&self, request: &WfmOutcomeExecutionRequest) -> WfmOutcomeExecutionResult {
        self.execute_wfm_outcome(&request.entity_id, request.entity_type, request.outcome)
            .await
    }

    pub async fn execute_wfm_outcome(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        outcome: OutcomeType,
    ) -> WfmOutcomeExecutionResult {
        let plan = match self.plan(entity_id, entity_type, outcome).await {
            Ok(plan) => plan,
            Err(rejection) => return self.reject(entity_id, entity_type, outcome, rejection),
        };

        let target_step_id = plan.mapping.target_step_id;
        if let Err(err) = self
            .stores
            .workflows
            .transition_step(entity_type, entity_id, target_step_id, plan.state.version)
            .await
        {
            return self.reject(entity_id, entity_type, outcome, err.into());
        }

        info!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            outcome = %outcome,
            from = %plan.state.current_step.id,
            to = %target_step_id,
            "Outcome executed"
        );

        let mut result = WfmOutcomeExecutionResult {
            success: true,
            outcome_executed: true,
            target_step_id: Some(target_step_id),
            ..WfmOutcomeExecutionResult::default()
        };

        let snapshot = match self.stores.entities.load_snapshot(entity_type, entity_id).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "Could not reload entity after outcome");
                result
                    .errors
                    .push(format!("could not reload entity after transition: {}", e));
                None
            }
        };

        if let Some(spec) = self.conversion_for(&plan, outcome, &mut result).await {
            let conversion = match &snapshot {
                Some(snapshot) => {
                    match self.converter.convert(entity_type, entity_id, snapshot, &spec).await {
                        Ok(created) => SideEffectResult::converted(spec.target_entity_type, created),
                        Err(e) => {
                            warn!(
                                entity_id = %entity_id,
                                target = %spec.target_entity_type,
                                error = %e,
                                "Conversion side effect failed"
                            );
                            SideEffectResult::failed(spec.target_entity_type, e.to_string())
                        }
                    }
                }
                None => SideEffectResult::failed(
                    spec.target_entity_type,
                    "source entity could not be loaded",
                ),
            };
            result.side_effects_applied.entity_conversion = Some(conversion);
        }

        if let (Some(engine), Some(snapshot)) = (&self.rule_engine, snapshot) {
            let delta = ChangeDelta::new().with_change(
                "current_step_id",
                Value::String(plan.state.current_step.id.to_string()),
                Value::String(target_step_id.to_string()),
            );
            let summary = engine
                .process_business_rules(
                    entity_type,
                    entity_id,
                    &event_name(entity_type, MutationKind::StepChanged),
                    snapshot,
                    delta,
                )
                .await;
            result.side_effects_applied.business_rules = Some(summary);
        }

        result
    }

    /// Every check that can reject the request. Reads only.
    async fn plan(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        outcome: OutcomeType,
    ) -> Result<OutcomePlan, OutcomeRejection> {
        if !entity_type.has_workflow() {
            return Err(OutcomeRejection::NoWorkflow(entity_type));
        }

        let state = self
            .stores
            .workflows
            .workflow_state(entity_type, entity_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    OutcomeRejection::NotFound {
                        entity_type,
                        entity_id: entity_id.to_string(),
                    }
                } else {
                    e.into()
                }
            })?;

        if state.current_step.is_final_step {
            return Err(OutcomeRejection::AlreadyTerminal);
        }

        let mapping = self
            .stores
            .workflows
            .active_step_mapping(state.workflow_id, outcome)
            .await?
            .filter(|m| m.is_active)
            .ok_or(OutcomeRejection::OutcomeUnavailable)?;

        let target = self.stores.workflows.get_step(mapping.target_step_id).await?;
        if target.workflow_id != state.workflow_id {
            return Err(OutcomeRejection::ForeignTargetStep(target.id));
        }

        Ok(OutcomePlan { state, mapping })
    }

    /// Conversion declared on the mapping, else on an active outcome rule.
    async fn conversion_for(
        &self,
        plan: &OutcomePlan,
        outcome: OutcomeType,
        result: &mut WfmOutcomeExecutionResult,
    ) -> Option<ConversionSpec> {
        if let Some(spec) = &plan.mapping.side_effects.entity_conversion {
            return Some(spec.clone());
        }

        match self
            .stores
            .workflows
            .active_outcome_rule(plan.state.workflow_id, outcome)
            .await
        {
            Ok(rule) => rule
                .filter(|r| r.is_active)
                .and_then(|r| r.side_effects.entity_conversion),
            Err(e) => {
                warn!(workflow_id = %plan.state.workflow_id, error = %e, "Outcome rule lookup failed");
                result.errors.push(format!("outcome rule lookup failed: {}", e));
                None
            }
        }
    }

    fn reject(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        outcome: OutcomeType,
        rejection: OutcomeRejection,
    ) -> WfmOutcomeExecutionResult {
        match &rejection {
            OutcomeRejection::Store(e) => {
                error!(entity_type = %entity_type, entity_id = %entity_id, outcome = %outcome, error = %e, "Outcome execution failed")
            }
            _ => {
                info!(entity_type = %entity_type, entity_id = %entity_id, outcome = %outcome, reason = %rejection, "Outcome rejected")
            }
        }
        WfmOutcomeExecutionResult::rejected(rejection.to_string())
    }
}
