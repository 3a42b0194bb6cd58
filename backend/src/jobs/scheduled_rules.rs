// Scheduled Rules Job - Sweeps ACTIVE SCHEDULE rules over current entity snapshots

use std::sync::Arc;
use tracing::info;

use super::JobResult;
use crate::rules::{RuleEngine, ScheduledSweepSummary};

pub struct ScheduledRulesJob {
    engine: Arc<RuleEngine>,
    batch_size: i64,
}

impl ScheduledRulesJob {
    pub fn new(engine: Arc<RuleEngine>, batch_size: i64) -> Self {
        Self {
            engine,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(&self) -> JobResult<ScheduledSweepSummary> {
        info!(batch_size = self.batch_size, "Running scheduled rules sweep");
        Ok(self.engine.run_scheduled_rules(self.batch_size).await)
    }
}
