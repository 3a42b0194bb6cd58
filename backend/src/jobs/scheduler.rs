// Job Scheduler - Central scheduler for the rules engine background jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{NotificationCleanupJob, ScheduledRulesJob};
use crate::config::JobsConfig;
use crate::rules::RuleEngine;
use crate::store::{StoreError, Stores};

pub const SCHEDULED_RULES_JOB: &str = "scheduled_rules";
pub const NOTIFICATION_CLEANUP_JOB: &str = "notification_cleanup";

const MAX_EXECUTION_LOGS: usize = 100;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Job execution error: {0}")]
    ExecutionError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i64,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    PartialFailure,
}

impl JobExecutionLog {
    fn finished(
        job_name: &str,
        started_at: DateTime<Utc>,
        items_processed: i64,
        errors: Vec<String>,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            started_at,
            completed_at: Some(completed_at),
            status: if errors.is_empty() {
                JobStatus::Completed
            } else {
                JobStatus::PartialFailure
            },
            items_processed,
            errors,
            duration_ms: Some((completed_at - started_at).num_milliseconds()),
        }
    }

    fn failed(job_name: &str, started_at: DateTime<Utc>, error: &JobError) -> Self {
        Self {
            status: JobStatus::Failed,
            ..Self::finished(job_name, started_at, 0, vec![error.to_string()])
        }
    }
}

type ExecutionLogs = Arc<RwLock<Vec<JobExecutionLog>>>;

async fn push_log(logs: &ExecutionLogs, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    // Keep only the most recent logs
    if logs.len() > MAX_EXECUTION_LOGS {
        let excess = logs.len() - MAX_EXECUTION_LOGS;
        logs.drain(..excess);
    }
}

async fn run_scheduled_rules(job: &ScheduledRulesJob, logs: &ExecutionLogs) -> JobExecutionLog {
    let started_at = Utc::now();
    let log = match job.run().await {
        Ok(sweep) => {
            info!(
                "Scheduled rules sweep completed: {} entities scanned, {} notifications created",
                sweep.entities_scanned, sweep.notifications_created
            );
            JobExecutionLog::finished(
                SCHEDULED_RULES_JOB,
                started_at,
                sweep.rules_evaluated as i64,
                sweep.errors,
            )
        }
        Err(e) => {
            error!("Scheduled rules sweep failed: {}", e);
            JobExecutionLog::failed(SCHEDULED_RULES_JOB, started_at, &e)
        }
    };
    push_log(logs, log.clone()).await;
    log
}

async fn run_notification_cleanup(job: &NotificationCleanupJob, logs: &ExecutionLogs) -> JobExecutionLog {
    let started_at = Utc::now();
    let log = match job.run().await {
        Ok(purged) => JobExecutionLog::finished(NOTIFICATION_CLEANUP_JOB, started_at, purged as i64, Vec::new()),
        Err(e) => {
            warn!("Notification cleanup failed: {}", e);
            JobExecutionLog::failed(NOTIFICATION_CLEANUP_JOB, started_at, &e)
        }
    };
    push_log(logs, log.clone()).await;
    log
}

/// Cron expression for the cleanup job: every N hours below a day, otherwise daily at 3 AM.
pub fn cleanup_cron(interval_hours: u64) -> String {
    if (1..24).contains(&interval_hours) {
        format!("0 0 */{} * * *", interval_hours)
    } else {
        "0 0 3 * * *".to_string()
    }
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    scheduled_rules: Arc<ScheduledRulesJob>,
    notification_cleanup: Arc<NotificationCleanupJob>,
    config: JobsConfig,
    execution_logs: ExecutionLogs,
}

impl JobScheduler {
    pub async fn new(engine: Arc<RuleEngine>, stores: &Stores, config: JobsConfig) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            scheduled_rules: Arc::new(ScheduledRulesJob::new(
                engine,
                config.scheduled_rules_batch_size,
            )),
            notification_cleanup: Arc::new(NotificationCleanupJob::new(
                stores.notifications.clone(),
            )),
            config,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_scheduled_rules().await?;
        self.schedule_notification_cleanup().await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_scheduled_rules(&self) -> JobResult<()> {
        if !self.config.scheduled_rules_enabled() {
            info!("Scheduled rules sweep is disabled");
            return Ok(());
        }

        let interval = self.config.scheduled_rules_interval_minutes;
        let job_runner = self.scheduled_rules.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_repeated_async(Duration::from_secs(interval * 60), move |_uuid, _lock| {
            let job_runner = job_runner.clone();
            let logs = logs.clone();

            Box::pin(async move {
                run_scheduled_rules(&job_runner, &logs).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled rules sweep to run every {} minutes", interval);

        Ok(())
    }

    async fn schedule_notification_cleanup(&self) -> JobResult<()> {
        let cron_expr = cleanup_cron(self.config.notification_cleanup_interval_hours);
        let job_runner = self.notification_cleanup.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let job_runner = job_runner.clone();
            let logs = logs.clone();

            Box::pin(async move {
                run_notification_cleanup(&job_runner, &logs).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled notification cleanup ({})", cron_expr);

        Ok(())
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    pub async fn run_job_now(&self, job_name: &str) -> JobResult<JobExecutionLog> {
        match job_name {
            SCHEDULED_RULES_JOB => Ok(run_scheduled_rules(&self.scheduled_rules, &self.execution_logs).await),
            NOTIFICATION_CLEANUP_JOB => {
                Ok(run_notification_cleanup(&self.notification_cleanup, &self.execution_logs).await)
            }
            _ => Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
        }
    }
}
