use std::time::Duration;

use dealflow_shared::{ChangeDelta, EntityType, ExecutionStatus, NotificationPriority};
use uuid::Uuid;

use crate::rules::{ActionDispatcher, BusinessRule, RecipientSelector, RuleAction};
use crate::tests::helpers::TestContext;

fn role_rule(role: &str) -> BusinessRule {
    BusinessRule::new("Tell the managers", EntityType::Deal)
        .on_event("DEAL_UPDATED")
        .then(RuleAction::notify(
            RecipientSelector::Role {
                role: role.to_string(),
            },
            "{{deal_name}} needs review",
            "",
            NotificationPriority::Normal,
        ))
}

#[tokio::test]
async fn test_role_notifies_every_member() {
    let ctx = TestContext::new().await;
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    ctx.store.seed_role("sales_manager", a).await;
    ctx.store.seed_role("sales_manager", b).await;
    ctx.store.seed_rule(role_rule("sales_manager")).await;

    let summary = ctx.deal_updated(&ctx.deal(), ChangeDelta::new()).await;

    assert_eq!(summary.notifications_created, 2);
    let mut recipients: Vec<_> = ctx
        .store
        .notifications()
        .await
        .iter()
        .map(|n| n.user_id)
        .collect();
    recipients.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(recipients, expected);
}

async fn seed_managers(ctx: &TestContext, count: usize) {
    for _ in 0..count {
        ctx.store.seed_role("sales_manager", Uuid::new_v4()).await;
    }
    ctx.store.seed_rule(role_rule("sales_manager")).await;
}

#[tokio::test]
async fn test_failed_write_keeps_earlier_notifications_counted() {
    let ctx = TestContext::new().await;
    seed_managers(&ctx, 3).await;
    ctx.store.fail_notifications_after(2);

    let summary = ctx.deal_updated(&ctx.deal(), ChangeDelta::new()).await;

    assert_eq!(ctx.store.notifications().await.len(), 2);
    assert_eq!(summary.notifications_created, 2);
    assert_eq!(summary.errors.len(), 1);

    let execution = &ctx.store.executions().await[0];
    assert_eq!(execution.status, ExecutionStatus::PartialFailure);
    assert_eq!(execution.notifications_created, 2);
}

#[tokio::test]
async fn test_timeout_keeps_earlier_notifications_counted() {
    let ctx = TestContext::with_timeout(Duration::from_millis(500)).await;
    seed_managers(&ctx, 3).await;
    // writes finish at 200ms and 400ms; the third is cut off at 500ms
    ctx.store.set_notification_delay(Duration::from_millis(200));

    let summary = ctx.deal_updated(&ctx.deal(), ChangeDelta::new()).await;

    let persisted = ctx.store.notifications().await.len() as u32;
    assert_eq!(persisted, 2);
    assert_eq!(summary.notifications_created, persisted);

    let execution = &ctx.store.executions().await[0];
    assert_eq!(execution.status, ExecutionStatus::TimedOut);
    assert_eq!(execution.notifications_created, 2);
}

#[tokio::test]
async fn test_empty_role_falls_back_to_owner() {
    let ctx = TestContext::new().await;
    ctx.store.seed_rule(role_rule("nobody_has_this")).await;
    let deal = ctx.deal();

    let summary = ctx.deal_updated(&deal, ChangeDelta::new()).await;

    assert_eq!(summary.notifications_created, 1);
    assert_eq!(Some(ctx.store.notifications().await[0].user_id), deal.owner);
}

#[tokio::test]
async fn test_resolve_recipients() {
    let ctx = TestContext::new().await;
    let dispatcher = ActionDispatcher::new(ctx.stores.clone(), None);
    let deal = ctx.deal();
    let owner = deal.owner.unwrap();
    let creator = Uuid::new_v4();

    let explicit = Uuid::new_v4();
    let users = dispatcher
        .resolve_recipients(&RecipientSelector::User { user_id: explicit }, &deal.snapshot())
        .await
        .unwrap();
    assert_eq!(users, vec![explicit]);

    let field = RecipientSelector::Field {
        field: "created_by_user_id".to_string(),
    };
    let snapshot = deal.snapshot().with("created_by_user_id", creator.to_string());
    assert_eq!(
        dispatcher.resolve_recipients(&field, &snapshot).await.unwrap(),
        vec![creator]
    );
    assert_eq!(
        dispatcher.resolve_recipients(&field, &deal.snapshot()).await.unwrap(),
        vec![owner]
    );

    // created_by is the second owner field
    let unowned = deal
        .clone()
        .without_owner()
        .snapshot()
        .with("created_by_user_id", creator.to_string());
    assert_eq!(
        dispatcher
            .resolve_recipients(&RecipientSelector::Owner, &unowned)
            .await
            .unwrap(),
        vec![creator]
    );

    let nobody = deal.without_owner().snapshot();
    assert!(
        dispatcher
            .resolve_recipients(&RecipientSelector::Owner, &nobody)
            .await
            .unwrap()
            .is_empty()
    );
}
