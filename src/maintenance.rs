use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cache::QueryCacheStore;
use crate::error::Result;
use crate::execution::log::ExecutionLog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_entries: usize,
    pub invalid_entries: usize,
    pub stale_pending_logs: usize,
}

/// Periodic housekeeping: cache purges and sealing of abandoned attempts.
#[derive(Clone)]
pub struct Maintenance {
    cache: QueryCacheStore,
    log: ExecutionLog,
    pending_timeout: Duration,
}

impl Maintenance {
    pub fn new(cache: QueryCacheStore, log: ExecutionLog, pending_timeout: Duration) -> Self {
        Self {
            cache,
            log,
            pending_timeout,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        let report = SweepReport {
            invalid_entries: self.cache.sweep_invalid().await?,
            expired_entries: self.cache.sweep_expired().await?,
            stale_pending_logs: self.log.expire_stale_pending(self.pending_timeout).await?,
        };
        info!("Maintenance pass finished: {:?}", report);
        Ok(report)
    }

    /// Runs a pass every `period` until the task is aborted. Failed passes
    /// are logged and retried on the next tick.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!("Maintenance pass failed: {}", e);
                }
            }
        })
    }
}
