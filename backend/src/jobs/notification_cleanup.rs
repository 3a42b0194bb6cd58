// Notification Cleanup Job - Removes notifications past their expiry

use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::JobResult;
use crate::store::NotificationStore;

pub struct NotificationCleanupJob {
    notifications: Arc<dyn NotificationStore>,
}

impl NotificationCleanupJob {
    pub fn new(notifications: Arc<dyn NotificationStore>) -> Self {
        Self { notifications }
    }

    /// Returns the number of notifications removed.
    pub async fn run(&self) -> JobResult<u64> {
        let purged = self.notifications.purge_expired(Utc::now()).await?;
        if purged > 0 {
            info!(purged, "Purged expired notifications");
        }
        Ok(purged)
    }
}
