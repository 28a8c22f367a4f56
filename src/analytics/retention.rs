use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::settings::RetentionConfig;
use crate::storage::{window_start, LogStore, StoreResult};

/// Deletes request records past the retention horizon.
pub struct RetentionJob {
    log: Arc<dyn LogStore>,
    days: u32,
}

impl RetentionJob {
    pub fn new(log: Arc<dyn LogStore>, config: &RetentionConfig) -> Self {
        Self {
            log,
            days: config.days,
        }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        window_start(now, u64::from(self.days) * 86_400)
    }

    pub fn purge(&self) -> StoreResult<u64> {
        self.purge_at(Utc::now())
    }

    /// Remove records strictly older than `now - days`.
    pub fn purge_at(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let deleted = self.log.delete_older_than(self.cutoff(now))?;
        info!(deleted = deleted, retention_days = self.days, "Cleaned up old request logs");
        Ok(deleted)
    }
}
