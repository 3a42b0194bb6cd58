use serde_json::json;
use uuid::Uuid;

use dealflow_shared::{
    ConversionSpec, EntityType, NotificationPriority, OutcomeRule, OutcomeSideEffects,
    OutcomeType, StepMapping, WfmOutcomeExecutionRequest,
};

use crate::outcomes::{CONVERTED_TO_LINK, OUTCOME_UNAVAILABLE_ERROR, TERMINAL_STATE_ERROR};
use crate::rules::{BusinessRule, ConditionClause, RecipientSelector, RuleAction};
use crate::tests::fixtures::WorkflowFixture;
use crate::tests::helpers::TestContext;

async fn seeded_at_negotiating(ctx: &TestContext) {
    let deal = ctx.deal().at_step(&ctx.workflow.negotiating);
    ctx.seed_deal(&deal).await;
}

#[tokio::test]
async fn test_won_moves_deal_to_target_step() {
    let ctx = TestContext::new().await;
    seeded_at_negotiating(&ctx).await;
    ctx.store
        .seed_mapping(ctx.workflow.mapping(OutcomeType::Won, &ctx.workflow.won))
        .await;

    let request = WfmOutcomeExecutionRequest {
        entity_id: "d1".to_string(),
        entity_type: EntityType::Deal,
        outcome: OutcomeType::Won,
    };
    let result = ctx.executor.execute(&request).await;

    assert!(result.success);
    assert!(result.outcome_executed);
    assert_eq!(result.target_step_id, Some(ctx.workflow.won.id));
    assert!(result.errors.is_empty());
    assert!(result.side_effects_applied.entity_conversion.is_none());

    let rules = result.side_effects_applied.business_rules.unwrap();
    assert_eq!(rules.rules_evaluated, 0);

    let (snapshot, version) = ctx.store.entity(EntityType::Deal, "d1").await.unwrap();
    assert_eq!(snapshot.get_uuid("current_step_id"), Some(ctx.workflow.won.id));
    assert_eq!(version, 2);
}

#[tokio::test]
async fn test_terminal_entity_is_rejected_without_writes() {
    let ctx = TestContext::new().await;
    let deal = ctx.deal().at_step(&ctx.workflow.won);
    ctx.seed_deal(&deal).await;
    ctx.store
        .seed_mapping(ctx.workflow.mapping(OutcomeType::Lost, &ctx.workflow.lost))
        .await;

    let result = ctx
        .executor
        .execute_wfm_outcome("d1", EntityType::Deal, OutcomeType::Lost)
        .await;

    assert!(!result.success);
    assert!(!result.outcome_executed);
    assert_eq!(result.target_step_id, None);
    assert_eq!(result.errors, vec![TERMINAL_STATE_ERROR.to_string()]);
    assert_eq!(ctx.store.write_count(), 0);

    let (snapshot, version) = ctx.store.entity(EntityType::Deal, "d1").await.unwrap();
    assert_eq!(snapshot.get_uuid("current_step_id"), Some(ctx.workflow.won.id));
    assert_eq!(version, 1);
}

#[tokio::test]
async fn test_second_outcome_after_terminal_transition_is_rejected() {
    let ctx = TestContext::new().await;
    seeded_at_negotiating(&ctx).await;
    ctx.store
        .seed_mapping(ctx.workflow.mapping(OutcomeType::Won, &ctx.workflow.won))
        .await;
    ctx.store
        .seed_mapping(ctx.workflow.mapping(OutcomeType::Lost, &ctx.workflow.lost))
        .await;

    let won = ctx
        .executor
        .execute_wfm_outcome("d1", EntityType::Deal, OutcomeType::Won)
        .await;
    assert!(won.success);

    let lost = ctx
        .executor
        .execute_wfm_outcome("d1", EntityType::Deal, OutcomeType::Lost)
        .await;
    assert!(!lost.success);
    assert_eq!(lost.errors, vec![TERMINAL_STATE_ERROR.to_string()]);
}

#[tokio::test]
async fn test_missing_or_inactive_mapping_is_unavailable() {
    let ctx = TestContext::new().await;
    seeded_at_negotiating(&ctx).await;
    let inactive = StepMapping {
        is_active: false,
        ..ctx.workflow.mapping(OutcomeType::Lost, &ctx.workflow.lost)
    };
    ctx.store.seed_mapping(inactive).await;

    for outcome in [OutcomeType::Won, OutcomeType::Lost] {
        let result = ctx
            .executor
            .execute_wfm_outcome("d1", EntityType::Deal, outcome)
            .await;
        assert!(!result.success);
        assert_eq!(result.errors, vec![OUTCOME_UNAVAILABLE_ERROR.to_string()]);
    }
    assert_eq!(ctx.store.write_count(), 0);
}

#[tokio::test]
async fn test_foreign_target_step_is_rejected() {
    let ctx = TestContext::new().await;
    seeded_at_negotiating(&ctx).await;

    let other = WorkflowFixture::default();
    ctx.store.seed_step(other.won.clone()).await;
    let mapping = StepMapping {
        target_step_id: other.won.id,
        ..ctx.workflow.mapping(OutcomeType::Won, &ctx.workflow.won)
    };
    ctx.store.seed_mapping(mapping).await;

    let result = ctx
        .executor
        .execute_wfm_outcome("d1", EntityType::Deal, OutcomeType::Won)
        .await;

    assert!(!result.success);
    assert!(result.errors[0].contains(&other.won.id.to_string()));
    assert_eq!(ctx.store.write_count(), 0);
}

#[tokio::test]
async fn test_unknown_entity_and_workflowless_type() {
    let ctx = TestContext::new().await;

    let missing = ctx
        .executor
        .execute_wfm_outcome("d404", EntityType::Deal, OutcomeType::Won)
        .await;
    assert!(!missing.success);
    assert_eq!(missing.errors, vec!["DEAL d404 not found".to_string()]);

    let person = ctx
        .executor
        .execute_wfm_outcome("p1", EntityType::Person, OutcomeType::Won)
        .await;
    assert!(!person.success);
    assert_eq!(person.errors, vec!["PERSON entities have no workflow".to_string()]);
}

#[tokio::test]
async fn test_converted_creates_linked_lead() {
    let ctx = TestContext::new().await;
    seeded_at_negotiating(&ctx).await;
    ctx.store.seed_mapping(ctx.workflow.conversion_mapping()).await;

    let result = ctx
        .executor
        .execute_wfm_outcome("d1", EntityType::Deal, OutcomeType::Converted)
        .await;

    assert!(result.success);
    assert_eq!(result.target_step_id, Some(ctx.workflow.converted.id));

    let conversion = result.side_effects_applied.entity_conversion.unwrap();
    assert!(conversion.success);
    assert_eq!(conversion.target_entity_type, Some(EntityType::Lead));
    let lead_id = conversion.created_entity_id.unwrap();

    let (lead, _) = ctx.store.entity(EntityType::Lead, &lead_id).await.unwrap();
    assert_eq!(lead.get_str("name"), Some("Acme Deal"));
    assert_eq!(lead.get("estimated_value"), Some(&json!(95000)));
    assert_eq!(lead.get_str("estimated_close_date"), Some("2024-09-30"));
    assert_eq!(lead.get_str("converted_from_entity_id"), Some("d1"));
    assert_eq!(lead.get_str("converted_from_entity_type"), Some("DEAL"));

    let links = ctx.store.links().await;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].source_entity_type, EntityType::Deal);
    assert_eq!(links[0].source_entity_id, "d1");
    assert_eq!(links[0].target_entity_type, EntityType::Lead);
    assert_eq!(links[0].target_entity_id, lead_id);
    assert_eq!(links[0].link_type, CONVERTED_TO_LINK);
}

#[tokio::test]
async fn test_failed_conversion_keeps_the_transition() {
    let ctx = TestContext::new().await;
    seeded_at_negotiating(&ctx).await;
    ctx.store.seed_mapping(ctx.workflow.conversion_mapping()).await;
    ctx.store.set_fail_entity_creation(true);

    let result = ctx
        .executor
        .execute_wfm_outcome("d1", EntityType::Deal, OutcomeType::Converted)
        .await;

    assert!(result.success);
    assert!(result.outcome_executed);

    let conversion = result.side_effects_applied.entity_conversion.unwrap();
    assert!(!conversion.success);
    assert!(conversion.created_entity_id.is_none());
    assert!(conversion.error.is_some());

    let (snapshot, _) = ctx.store.entity(EntityType::Deal, "d1").await.unwrap();
    assert_eq!(snapshot.get_uuid("current_step_id"), Some(ctx.workflow.converted.id));
    assert!(ctx.store.entities_of(EntityType::Lead).await.is_empty());
    assert!(ctx.store.links().await.is_empty());
}

#[tokio::test]
async fn test_outcome_rule_supplies_conversion() {
    let ctx = TestContext::new().await;
    seeded_at_negotiating(&ctx).await;
    ctx.store
        .seed_mapping(ctx.workflow.mapping(OutcomeType::Converted, &ctx.workflow.converted))
        .await;
    ctx.store
        .seed_outcome_rule(OutcomeRule {
            id: Uuid::new_v4(),
            workflow_id: ctx.workflow.workflow_id,
            outcome_type: OutcomeType::Converted,
            is_active: true,
            side_effects: OutcomeSideEffects {
                entity_conversion: Some(ConversionSpec {
                    target_entity_type: EntityType::Lead,
                    field_mappings: [("name".to_string(), "name".to_string())].into(),
                }),
            },
        })
        .await;

    let result = ctx
        .executor
        .execute_wfm_outcome("d1", EntityType::Deal, OutcomeType::Converted)
        .await;

    let conversion = result.side_effects_applied.entity_conversion.unwrap();
    assert!(conversion.success);
    let lead_id = conversion.created_entity_id.unwrap();
    let (lead, _) = ctx.store.entity(EntityType::Lead, &lead_id).await.unwrap();
    assert_eq!(lead.get_str("name"), Some("Acme Deal"));
    assert!(!lead.contains("estimated_value"));
}

#[tokio::test]
async fn test_outcome_uses_latest_version() {
    let ctx = TestContext::new().await;
    seeded_at_negotiating(&ctx).await;
    ctx.store
        .seed_mapping(ctx.workflow.mapping(OutcomeType::Won, &ctx.workflow.won))
        .await;

    // Another writer got there first; the plan reads the new version.
    ctx.store.touch_entity(EntityType::Deal, "d1").await;

    let result = ctx
        .executor
        .execute_wfm_outcome("d1", EntityType::Deal, OutcomeType::Won)
        .await;

    assert!(result.success);
    let (_, version) = ctx.store.entity(EntityType::Deal, "d1").await.unwrap();
    assert_eq!(version, 3);
}

#[tokio::test]
async fn test_step_changed_rules_run_after_outcome() {
    let ctx = TestContext::new().await;
    seeded_at_negotiating(&ctx).await;
    ctx.store
        .seed_mapping(ctx.workflow.mapping(OutcomeType::Won, &ctx.workflow.won))
        .await;

    let rule = BusinessRule::new("Deal won", EntityType::Deal)
        .on_event("DEAL_STEP_CHANGED")
        .when(ConditionClause::changed_to(
            "current_step_id",
            ctx.workflow.won.id.to_string(),
        ))
        .then(RuleAction::notify(
            RecipientSelector::Owner,
            "Won: {{deal_name}}",
            "",
            NotificationPriority::Normal,
        ));
    ctx.store.seed_rule(rule.clone()).await;

    let result = ctx
        .executor
        .execute_wfm_outcome("d1", EntityType::Deal, OutcomeType::Won)
        .await;

    let rules = result.side_effects_applied.business_rules.unwrap();
    assert_eq!(rules.rules_evaluated, 1);
    assert_eq!(rules.notifications_created, 1);

    let notifications = ctx.store.notifications().await;
    assert_eq!(notifications[0].title, "Won: Acme Deal");

    let execution = &ctx.store.executions().await[0];
    assert_eq!(execution.execution_trigger, "DEAL_STEP_CHANGED");
    assert!(execution.conditions_met);
}
