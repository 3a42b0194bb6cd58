use chrono::{Duration, Utc};
use uuid::Uuid;

use dealflow_shared::{EntityType, Notification, NotificationPriority};

use crate::config::JobsConfig;
use crate::jobs::scheduler::{NOTIFICATION_CLEANUP_JOB, SCHEDULED_RULES_JOB};
use crate::jobs::{JobError, JobScheduler, JobStatus, NotificationCleanupJob, ScheduledRulesJob};
use crate::rules::{BusinessRule, SCHEDULED_EVENT, presets};
use crate::store::NotificationStore;
use crate::tests::fixtures::{DealFixture, high_value_notify};
use crate::tests::helpers::TestContext;

fn nightly_rule() -> BusinessRule {
    BusinessRule::new("Nightly high value check", EntityType::Deal)
        .scheduled()
        .when(presets::high_value_deal(90000))
        .then(high_value_notify())
}

async fn seed_pipeline(ctx: &TestContext) {
    ctx.seed_deal(&ctx.deal()).await;
    let small = DealFixture {
        id: "d2".to_string(),
        name: "Small Deal".to_string(),
        ..ctx.deal().with_amount(10000)
    };
    ctx.seed_deal(&small).await;
}

fn jobs_config() -> JobsConfig {
    JobsConfig {
        scheduled_rules_interval_minutes: 60,
        scheduled_rules_batch_size: 100,
        notification_cleanup_interval_hours: 6,
    }
}

#[tokio::test]
async fn test_sweep_evaluates_every_entity() {
    let ctx = TestContext::new().await;
    seed_pipeline(&ctx).await;
    ctx.store.seed_rule(nightly_rule()).await;
    // Event rules never run in the sweep
    ctx.store
        .seed_rule(
            BusinessRule::new("On update", EntityType::Deal)
                .on_event("DEAL_UPDATED")
                .then(high_value_notify()),
        )
        .await;

    let sweep = ctx.engine.run_scheduled_rules(100).await;

    assert_eq!(sweep.rules_loaded, 1);
    assert_eq!(sweep.entities_scanned, 2);
    assert_eq!(sweep.rules_evaluated, 2);
    assert_eq!(sweep.notifications_created, 1);
    assert!(sweep.errors.is_empty());

    let executions = ctx.store.executions().await;
    assert_eq!(executions.len(), 2);
    assert!(executions.iter().all(|e| e.execution_trigger == SCHEDULED_EVENT));

    let notifications = ctx.store.notifications().await;
    assert_eq!(notifications[0].entity_id.as_deref(), Some("d1"));
}

#[tokio::test]
async fn test_sweep_respects_batch_size() {
    let ctx = TestContext::new().await;
    seed_pipeline(&ctx).await;
    ctx.store.seed_rule(nightly_rule()).await;

    let sweep = ScheduledRulesJob::new(ctx.engine.clone(), 1).run().await.unwrap();

    assert_eq!(sweep.entities_scanned, 1);
    assert_eq!(sweep.rules_evaluated, 1);
}

#[tokio::test]
async fn test_sweep_with_rule_store_down() {
    let ctx = TestContext::new().await;
    seed_pipeline(&ctx).await;
    ctx.store.seed_rule(nightly_rule()).await;
    ctx.store.set_rules_unavailable(true);

    let sweep = ctx.engine.run_scheduled_rules(100).await;

    assert_eq!(sweep.rules_loaded, 0);
    assert_eq!(sweep.entities_scanned, 0);
    assert_eq!(sweep.errors.len(), 1);
    assert!(ctx.store.executions().await.is_empty());
}

#[tokio::test]
async fn test_cleanup_purges_expired_notifications() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let now = Utc::now();
    let live = Notification {
        id: Uuid::new_v4(),
        notification_type: "business_rule".to_string(),
        title: "still here".to_string(),
        message: String::new(),
        priority: NotificationPriority::Normal,
        user_id: user,
        entity_type: Some(EntityType::Deal),
        entity_id: Some("d1".to_string()),
        rule_id: None,
        metadata: serde_json::json!({}),
        created_at: now,
        is_read: false,
        expires_at: Some(now + Duration::hours(1)),
    };
    let expired = Notification {
        id: Uuid::new_v4(),
        title: "gone".to_string(),
        expires_at: Some(now - Duration::minutes(1)),
        ..live.clone()
    };
    ctx.stores.notifications.create_notification(&live).await.unwrap();
    ctx.stores.notifications.create_notification(&expired).await.unwrap();

    let purged = NotificationCleanupJob::new(ctx.stores.notifications.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(purged, 1);
    let remaining = ctx.store.notifications().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].title, "still here");
}

#[tokio::test]
async fn test_run_job_now_records_logs() {
    let ctx = TestContext::new().await;
    seed_pipeline(&ctx).await;
    ctx.store.seed_rule(nightly_rule()).await;

    let scheduler = JobScheduler::new(ctx.engine.clone(), &ctx.stores, jobs_config())
        .await
        .unwrap();

    let sweep = scheduler.run_job_now(SCHEDULED_RULES_JOB).await.unwrap();
    assert_eq!(sweep.status, JobStatus::Completed);
    assert_eq!(sweep.items_processed, 2);

    let cleanup = scheduler.run_job_now(NOTIFICATION_CLEANUP_JOB).await.unwrap();
    assert_eq!(cleanup.status, JobStatus::Completed);
    assert_eq!(cleanup.items_processed, 0);

    assert!(matches!(
        scheduler.run_job_now("unknown").await,
        Err(JobError::ConfigError(_))
    ));

    let logs = scheduler.get_execution_logs().await;
    let names: Vec<_> = logs.iter().map(|l| l.job_name.as_str()).collect();
    assert_eq!(names, vec![SCHEDULED_RULES_JOB, NOTIFICATION_CLEANUP_JOB]);
}

#[tokio::test]
async fn test_sweep_failure_is_partial() {
    let ctx = TestContext::new().await;
    ctx.store.seed_rule(nightly_rule()).await;
    ctx.store.set_rules_unavailable(true);

    let scheduler = JobScheduler::new(ctx.engine.clone(), &ctx.stores, jobs_config())
        .await
        .unwrap();
    let log = scheduler.run_job_now(SCHEDULED_RULES_JOB).await.unwrap();

    assert_eq!(log.status, JobStatus::PartialFailure);
    assert_eq!(log.errors.len(), 1);
}
