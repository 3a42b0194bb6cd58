// Background Jobs Service
//
// Scheduled work for the rules engine: the SCHEDULE-rule sweep and the
// expired-notification purge. Jobs run on tokio-cron-scheduler.

pub mod notification_cleanup;
pub mod scheduled_rules;
pub mod scheduler;

pub use notification_cleanup::NotificationCleanupJob;
pub use scheduled_rules::ScheduledRulesJob;
pub use scheduler::{JobError, JobExecutionLog, JobResult, JobScheduler, JobStatus};
