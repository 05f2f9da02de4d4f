//! Completion monitor.
//!
//! Two cadences: a fast pass that recomputes sync stats from the work-row
//! table and closes configurations whose work has drained, and a slow pass
//! that reverts configurations marked completed while work rows were still
//! pending. The derivation is a single grouped query; the monitor never
//! iterates work rows client-side.

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorSettings;
use crate::error::SyncResult;
use crate::models::ConfigStatus;
use crate::store::{configs, stats, work_rows};

pub struct CompletionMonitor {
    pool: PgPool,
    settings: MonitorSettings,
}

impl CompletionMonitor {
    pub fn new(pool: PgPool, settings: MonitorSettings) -> Self {
        Self { pool, settings }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        log::info!("monitor: started");

        let mut stats_tick = tokio::time::interval(self.settings.stats_interval);
        let mut recovery_tick = tokio::time::interval(self.settings.recovery_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = stats_tick.tick() => {
                    if let Err(e) = self.recompute_and_close().await {
                        log::error!("monitor: stats pass failed: {}", e);
                    }
                }
                _ = recovery_tick.tick() => {
                    if !self.settings.auto_recovery {
                        continue;
                    }
                    match self.recover_premature().await {
                        Ok(0) => {}
                        Ok(count) => log::warn!("monitor: reverted {} premature completions", count),
                        Err(e) => log::error!("monitor: recovery pass failed: {}", e),
                    }
                }
            }
        }

        log::info!("monitor: stopped");
    }

    /// Refresh stats for every in-progress configuration and close the ones
    /// whose work rows have all reached a terminal status.
    pub async fn recompute_and_close(&self) -> SyncResult<usize> {
        let mut closed = 0;

        for (config_id, status) in configs::in_progress(&self.pool).await? {
            let derived = stats::derive(&self.pool, config_id).await?;
            stats::write_derived(&self.pool, config_id, &derived).await?;

            // A configuration still in backfill may grow more rows; only
            // thread_sync configurations are eligible to close.
            if status == ConfigStatus::ThreadSync && derived.is_complete() {
                configs::complete(&self.pool, config_id).await?;
                closed += 1;
                log::info!(
                    "monitor: config {} completed - {} synced, {} failed, {} messages",
                    config_id,
                    derived.completed,
                    derived.failed,
                    derived.messages_synced
                );
            }
        }

        Ok(closed)
    }

    /// Revert configurations that were marked completed while work rows were
    /// still queued or processing. Guards against trigger races and manual
    /// status edits.
    pub async fn recover_premature(&self) -> SyncResult<usize> {
        let mut reverted = 0;

        for config_id in configs::completed_with_history(&self.pool).await? {
            let (queued, processing) = work_rows::pending_counts(&self.pool, config_id).await?;
            if queued + processing > 0 {
                configs::revert_premature(&self.pool, config_id).await?;
                reverted += 1;
                log::warn!(
                    "monitor: config {} completed prematurely ({} queued, {} processing), reverting to thread_sync",
                    config_id,
                    queued,
                    processing
                );
            }
        }

        Ok(reverted)
    }
}
