use std::time::Duration;

use dealflow_shared::{ChangeDelta, EntityType, ExecutionStatus, NotificationPriority};
use serde_json::json;

use crate::rules::{BusinessRule, ConditionClause, RecipientSelector, RuleAction, presets};
use crate::store::{ExecutionLog, ExecutionQuery, RuleStore};
use crate::tests::fixtures::{high_value_notify, high_value_rule};
use crate::tests::helpers::TestContext;

#[tokio::test]
async fn test_high_value_deal_notifies_owner() {
    let ctx = TestContext::new().await;
    let rule = high_value_rule();
    ctx.store.seed_rule(rule.clone()).await;

    let deal = ctx.deal();
    ctx.seed_deal(&deal).await;

    let delta = ChangeDelta::new().with_change("amount", json!(50000), json!(95000));
    let summary = ctx.deal_updated(&deal, delta).await;

    assert_eq!(summary.rules_evaluated, 1);
    assert_eq!(summary.notifications_created, 1);
    assert!(summary.errors.is_empty());

    let notifications = ctx.store.notifications().await;
    assert_eq!(notifications.len(), 1);
    let notification = &notifications[0];
    assert_eq!(notification.title, "High value deal: Acme Deal");
    assert_eq!(notification.message, "Acme Deal is worth 95,000.00 USD");
    assert_eq!(notification.priority, NotificationPriority::High);
    assert_eq!(Some(notification.user_id), deal.owner);
    assert_eq!(notification.entity_type, Some(EntityType::Deal));
    assert_eq!(notification.entity_id.as_deref(), Some("d1"));
    assert_eq!(notification.rule_id, Some(rule.id));
    assert!(!notification.is_read);

    let executions = ctx.store.executions().await;
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.rule_id, rule.id);
    assert_eq!(execution.entity_id, "d1");
    assert_eq!(execution.execution_trigger, "DEAL_UPDATED");
    assert!(execution.conditions_met);
    assert_eq!(execution.notifications_created, 1);
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert!(execution.execution_time_ms >= 0);
}

#[tokio::test]
async fn test_unmet_conditions_are_audited_without_side_effects() {
    let ctx = TestContext::new().await;
    ctx.store.seed_rule(high_value_rule()).await;

    let deal = ctx.deal().with_amount(50000);
    let delta = ChangeDelta::new().with_change("amount", json!(95000), json!(50000));
    let summary = ctx.deal_updated(&deal, delta).await;

    assert_eq!(summary.rules_evaluated, 1);
    assert_eq!(summary.notifications_created, 0);
    assert!(ctx.store.notifications().await.is_empty());

    let executions = ctx.store.executions().await;
    assert_eq!(executions.len(), 1);
    assert!(!executions[0].conditions_met);
    assert_eq!(executions[0].status, ExecutionStatus::Skipped);
    assert_eq!(executions[0].execution_time_ms, 0);
    assert_eq!(executions[0].notifications_created, 0);
}

#[tokio::test]
async fn test_rule_without_conditions_always_fires() {
    let ctx = TestContext::new().await;
    let rule = BusinessRule::new("Every update", EntityType::Deal)
        .on_event("DEAL_UPDATED")
        .then(high_value_notify());
    ctx.store.seed_rule(rule).await;

    let deal = ctx.deal().with_amount(10);
    let summary = ctx.deal_updated(&deal, ChangeDelta::new()).await;

    assert_eq!(summary.notifications_created, 1);
    assert!(ctx.store.executions().await[0].conditions_met);
}

#[tokio::test]
async fn test_rules_for_other_events_and_types_are_ignored() {
    let ctx = TestContext::new().await;
    ctx.store
        .seed_rule(
            BusinessRule::new("Created only", EntityType::Deal)
                .on_event("DEAL_CREATED")
                .then(high_value_notify()),
        )
        .await;
    ctx.store
        .seed_rule(
            BusinessRule::new("Lead rule", EntityType::Lead)
                .on_event("DEAL_UPDATED")
                .then(high_value_notify()),
        )
        .await;

    let summary = ctx.deal_updated(&ctx.deal(), ChangeDelta::new()).await;

    assert_eq!(summary.rules_evaluated, 0);
    assert!(ctx.store.executions().await.is_empty());
}

#[tokio::test]
async fn test_changed_conditions_read_the_delta() {
    let ctx = TestContext::new().await;
    let rule = BusinessRule::new("Reassigned", EntityType::Deal)
        .on_event("DEAL_UPDATED")
        .when(presets::owner_changed())
        .then(high_value_notify());
    ctx.store.seed_rule(rule).await;
    let deal = ctx.deal();

    let unchanged = ctx
        .deal_updated(&deal, ChangeDelta::new().with_change("amount", json!(1), json!(2)))
        .await;
    assert_eq!(unchanged.notifications_created, 0);

    let owner = deal.owner.map(|o| o.to_string());
    let reassigned = ctx
        .deal_updated(
            &deal,
            ChangeDelta::new().with_change("assigned_to_user_id", json!(null), json!(owner)),
        )
        .await;
    assert_eq!(reassigned.notifications_created, 1);
}

#[tokio::test]
async fn test_rules_run_in_priority_order_with_monotonic_audit() {
    let ctx = TestContext::new().await;
    let second = BusinessRule::new("second", EntityType::Deal)
        .on_event("DEAL_UPDATED")
        .with_priority(20)
        .then(high_value_notify());
    let first = BusinessRule::new("first", EntityType::Deal)
        .on_event("DEAL_UPDATED")
        .with_priority(10)
        .then(high_value_notify());
    let third = BusinessRule::new("third", EntityType::Deal)
        .on_event("DEAL_UPDATED")
        .with_priority(30)
        .when(ConditionClause::below("amount", 1))
        .then(high_value_notify());
    for rule in [&second, &third, &first] {
        ctx.store.seed_rule(rule.clone()).await;
    }

    let summary = ctx.deal_updated(&ctx.deal(), ChangeDelta::new()).await;
    assert_eq!(summary.rules_evaluated, 3);
    assert_eq!(summary.notifications_created, 2);

    let executions = ctx.store.executions().await;
    let order: Vec<_> = executions.iter().map(|e| e.rule_id).collect();
    assert_eq!(order, vec![first.id, second.id, third.id]);
    assert!(
        executions
            .windows(2)
            .all(|pair| pair[0].executed_at <= pair[1].executed_at)
    );
}

#[tokio::test]
async fn test_owner_notification_without_owner_is_skipped() {
    let ctx = TestContext::new().await;
    let deal = ctx.deal().without_owner();
    ctx.seed_deal(&deal).await;

    let rule = BusinessRule::new("Advance big deals", EntityType::Deal)
        .on_event("DEAL_UPDATED")
        .when(presets::high_value_deal(90000))
        .then(high_value_notify())
        .then(RuleAction::transition_step(ctx.workflow.negotiating.id));
    ctx.store.seed_rule(rule).await;

    let summary = ctx.deal_updated(&deal, ChangeDelta::new()).await;

    assert_eq!(summary.notifications_created, 0);
    assert!(summary.errors.is_empty());
    assert!(ctx.store.notifications().await.is_empty());

    let (snapshot, version) = ctx.store.entity(EntityType::Deal, "d1").await.unwrap();
    assert_eq!(snapshot.get_uuid("current_step_id"), Some(ctx.workflow.negotiating.id));
    assert_eq!(version, 2);

    let executions = ctx.store.executions().await;
    assert_eq!(executions[0].status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn test_failed_action_does_not_stop_the_next_one() {
    let ctx = TestContext::new().await;
    let deal = ctx.deal().at_step(&ctx.workflow.won);
    ctx.seed_deal(&deal).await;

    let rule = BusinessRule::new("Reopen", EntityType::Deal)
        .on_event("DEAL_UPDATED")
        .then(RuleAction::transition_step(ctx.workflow.open.id))
        .then(high_value_notify());
    ctx.store.seed_rule(rule).await;

    let summary = ctx.deal_updated(&deal, ChangeDelta::new()).await;

    assert_eq!(summary.notifications_created, 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].starts_with("rule 'Reopen': action 1 (transition_step)"));

    let execution = &ctx.store.executions().await[0];
    assert_eq!(execution.status, ExecutionStatus::PartialFailure);
    assert_eq!(execution.notifications_created, 1);

    let (_, version) = ctx.store.entity(EntityType::Deal, "d1").await.unwrap();
    assert_eq!(version, 1);
}

#[tokio::test]
async fn test_slow_rule_times_out_and_the_next_rule_runs() {
    let ctx = TestContext::with_timeout(Duration::from_millis(50)).await;
    let deal = ctx.deal();
    ctx.seed_deal(&deal).await;

    let slow = BusinessRule::new("slow", EntityType::Deal)
        .on_event("DEAL_UPDATED")
        .with_priority(10)
        .then(high_value_notify());
    let fast = BusinessRule::new("fast", EntityType::Deal)
        .on_event("DEAL_UPDATED")
        .with_priority(20)
        .then(RuleAction::transition_step(ctx.workflow.negotiating.id));
    ctx.store.seed_rule(slow.clone()).await;
    ctx.store.seed_rule(fast.clone()).await;

    ctx.store.set_notification_delay(Duration::from_millis(500));
    let summary = ctx.deal_updated(&deal, ChangeDelta::new()).await;

    assert_eq!(summary.rules_evaluated, 2);
    assert_eq!(summary.notifications_created, 0);
    assert_eq!(summary.errors, vec!["rule 'slow': timed out after 50ms".to_string()]);

    let executions = ctx.store.executions().await;
    assert_eq!(executions[0].rule_id, slow.id);
    assert_eq!(executions[0].status, ExecutionStatus::TimedOut);
    assert_eq!(executions[1].rule_id, fast.id);
    assert_eq!(executions[1].status, ExecutionStatus::Succeeded);
    assert!(ctx.store.notifications().await.is_empty());
}

#[tokio::test]
async fn test_unavailable_rule_store_applies_nothing() {
    let ctx = TestContext::new().await;
    ctx.store.seed_rule(high_value_rule()).await;
    ctx.store.set_rules_unavailable(true);

    let summary = ctx.deal_updated(&ctx.deal(), ChangeDelta::new()).await;

    assert_eq!(summary.rules_evaluated, 0);
    assert_eq!(summary.notifications_created, 0);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].starts_with("rule store unavailable"));
    assert!(ctx.store.executions().await.is_empty());
    assert_eq!(ctx.store.write_count(), 0);
}

#[tokio::test]
async fn test_deactivated_rule_stops_firing() {
    let ctx = TestContext::new().await;
    let rule = high_value_rule();
    ctx.store.seed_rule(rule.clone()).await;
    let deal = ctx.deal();

    assert_eq!(ctx.deal_updated(&deal, ChangeDelta::new()).await.notifications_created, 1);

    ctx.stores
        .rules
        .set_rule_status(rule.id, dealflow_shared::RuleStatus::Inactive)
        .await
        .unwrap();

    let summary = ctx.deal_updated(&deal, ChangeDelta::new()).await;
    assert_eq!(summary.rules_evaluated, 0);
    assert_eq!(ctx.store.notifications().await.len(), 1);

    let history = ctx
        .stores
        .executions
        .list_executions(&ExecutionQuery::for_rule(rule.id))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_notification_ttl_sets_expiry() {
    let ctx = TestContext::with_config(crate::rules::EngineConfig {
        notification_ttl: Some(chrono::Duration::hours(24)),
        ..Default::default()
    })
    .await;
    ctx.store.seed_rule(high_value_rule()).await;

    ctx.deal_updated(&ctx.deal(), ChangeDelta::new()).await;

    let notification = &ctx.store.notifications().await[0];
    assert_eq!(
        notification.expires_at,
        Some(notification.created_at + chrono::Duration::hours(24))
    );
}

#[tokio::test]
async fn test_unresolved_placeholders_are_kept_and_recorded() {
    let ctx = TestContext::new().await;
    let rule = BusinessRule::new("Typo", EntityType::Deal)
        .on_event("DEAL_UPDATED")
        .then(RuleAction::notify(
            RecipientSelector::Owner,
            "Deal {{deal_name}} owned by {{deal_owner_name}}",
            "",
            NotificationPriority::Normal,
        ));
    ctx.store.seed_rule(rule).await;

    ctx.deal_updated(&ctx.deal(), ChangeDelta::new()).await;

    let notification = &ctx.store.notifications().await[0];
    assert_eq!(notification.title, "Deal Acme Deal owned by {{deal_owner_name}}");
    assert_eq!(
        notification.metadata["unresolved_placeholders"],
        json!(["deal_owner_name"])
    );
}
