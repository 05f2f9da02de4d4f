//! Backfill orchestrator.
//!
//! Consumes `inbox_backfill_jobs`, paginates the provider's thread listing
//! over a clamped date window, materializes one work row per unseen thread,
//! and, once the cursor is exhausted, transitions the configuration to
//! thread_sync and bulk-publishes every queued row to `thread_sync_jobs`. A
//! startup sweep publishes rows orphaned by a crash between row insertion and
//! queue publication.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::BackfillSettings;
use crate::error::SyncResult;
use crate::models::{BackfillCheckpoint, ThreadWorkRow};
use crate::payloads::{BackfillJob, ThreadSyncJob};
use crate::provider::{EmailProvider, ListThreadsParams};
use crate::queue::{JobQueue, QueueMessage, INBOX_BACKFILL_JOBS, THREAD_SYNC_JOBS};
use crate::store::{configs, inboxes, stats, threads, work_rows};

/// Clamp a requested window to at most `max_days` by advancing the start.
/// Returns the effective window and whether it was adjusted.
pub fn clamp_window(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_days: i64,
) -> (DateTime<Utc>, DateTime<Utc>, bool) {
    if end - start > ChronoDuration::days(max_days) {
        (end - ChronoDuration::days(max_days), end, true)
    } else {
        (start, end, false)
    }
}

enum BackfillOutcome {
    Finished,
    Interrupted,
}

pub struct BackfillOrchestrator {
    pool: PgPool,
    queue: JobQueue,
    provider: Arc<dyn EmailProvider>,
    settings: BackfillSettings,
    api_delay: Duration,
}

impl BackfillOrchestrator {
    pub fn new(
        pool: PgPool,
        queue: JobQueue,
        provider: Arc<dyn EmailProvider>,
        settings: BackfillSettings,
        api_delay: Duration,
    ) -> Self {
        Self {
            pool,
            queue,
            provider,
            settings,
            api_delay,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        log::info!("backfill: orchestrator started");

        match self.sweep_unpublished().await {
            Ok(0) => {}
            Ok(count) => log::info!("backfill: startup sweep published {} orphaned rows", count),
            Err(e) => log::error!("backfill: startup sweep failed: {}", e),
        }

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let messages = match self
                .queue
                .read(INBOX_BACKFILL_JOBS, self.settings.visibility, 1)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    log::error!("backfill: queue read failed: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.poll_interval) => continue,
                    }
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
                continue;
            }

            for message in messages {
                self.handle_message(&message, &shutdown).await;
            }
        }

        log::info!("backfill: orchestrator stopped");
    }

    /// Claim and process at most one job. Exposed for tests and manual drains.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> SyncResult<bool> {
        let messages = self
            .queue
            .read(INBOX_BACKFILL_JOBS, self.settings.visibility, 1)
            .await?;

        if messages.is_empty() {
            return Ok(false);
        }
        for message in &messages {
            self.handle_message(message, shutdown).await;
        }
        Ok(true)
    }

    async fn handle_message(&self, message: &QueueMessage, shutdown: &CancellationToken) {
        let job: BackfillJob = match serde_json::from_value(message.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                log::error!("backfill: dropping malformed job {}: {}", message.msg_id, e);
                let _ = self.queue.delete(INBOX_BACKFILL_JOBS, message.msg_id).await;
                return;
            }
        };

        if message.read_ct > self.settings.max_retries {
            log::error!(
                "backfill: config {} exhausted {} retries, giving up",
                job.config_id,
                self.settings.max_retries
            );
            let _ = configs::mark_failed(&self.pool, job.config_id, "backfill retries exhausted")
                .await;
            let _ = self.queue.delete(INBOX_BACKFILL_JOBS, message.msg_id).await;
            return;
        }

        match self.run_backfill(&job, shutdown).await {
            Ok(BackfillOutcome::Finished) => {
                if let Err(e) = self.queue.delete(INBOX_BACKFILL_JOBS, message.msg_id).await {
                    log::error!("backfill: failed to ack job {}: {}", message.msg_id, e);
                }
            }
            Ok(BackfillOutcome::Interrupted) => {
                log::info!(
                    "backfill: config {} interrupted by shutdown, job will redeliver",
                    job.config_id
                );
            }
            Err(e) => {
                log::error!("backfill: config {} failed: {}", job.config_id, e);
                if let Err(err) =
                    configs::mark_failed(&self.pool, job.config_id, &e.to_string()).await
                {
                    log::error!("backfill: failed to record failure: {}", err);
                }
                // Not acked; the visibility timeout drives the retry.
            }
        }
    }

    async fn run_backfill(
        &self,
        job: &BackfillJob,
        shutdown: &CancellationToken,
    ) -> SyncResult<BackfillOutcome> {
        let (start, end, clamped) =
            clamp_window(job.start_date, job.end_date, self.settings.window_days);
        if clamped {
            log::info!(
                "backfill: config {} date range clamped to {} days ({} -> {})",
                job.config_id,
                self.settings.window_days,
                start,
                end
            );
        }

        configs::begin_backfill(&self.pool, job.config_id).await?;
        stats::init(&self.pool, job.config_id).await?;

        let mut checkpoint = configs::load_checkpoint(&self.pool, job.config_id)
            .await?
            .unwrap_or_default();
        if checkpoint.current_page > 0 {
            log::info!(
                "backfill: config {} resuming from page {} ({} threads queued so far)",
                job.config_id,
                checkpoint.current_page,
                checkpoint.threads_queued
            );
        }

        // Short-circuits the per-thread existence check within this run only.
        let mut seen: HashSet<String> = HashSet::new();
        let mut page_token = checkpoint.last_page_token.clone();

        loop {
            if shutdown.is_cancelled() {
                return Ok(BackfillOutcome::Interrupted);
            }

            let params = ListThreadsParams {
                limit: self.settings.page_size,
                after_ts: Some(start.timestamp()),
                before_ts: Some(end.timestamp()),
                page_token: page_token.clone(),
            };
            let page = self.provider.list_threads(&job.grant_id, &params).await?;

            let remote_ids: Vec<String> = page.data.iter().map(|t| t.id.clone()).collect();
            let existing = threads::existing_remote_ids(&self.pool, &remote_ids).await?;

            let mut new_rows = 0;
            for thread in &page.data {
                if seen.contains(&thread.id) || existing.contains(&thread.id) {
                    continue;
                }
                work_rows::upsert_queued(&self.pool, job.config_id, &thread.id, &job.grant_id)
                    .await?;
                seen.insert(thread.id.clone());
                new_rows += 1;
            }

            if new_rows > 0 {
                stats::record_queued(&self.pool, job.config_id, new_rows).await?;
            }

            checkpoint.threads_queued += new_rows as u32;
            checkpoint.current_page += 1;
            checkpoint.last_page_token = page.next_cursor.clone();
            configs::save_checkpoint(&self.pool, job.config_id, &checkpoint).await?;

            log::debug!(
                "backfill: config {} page {} queued {} new threads",
                job.config_id,
                checkpoint.current_page,
                new_rows
            );

            if page.next_cursor.is_none() {
                break;
            }
            page_token = page.next_cursor;
            tokio::time::sleep(self.api_delay).await;
        }

        configs::transition_to_thread_sync(&self.pool, job.config_id).await?;

        let published = self
            .publish_queued_rows(job.config_id, job.inbox_id)
            .await?;
        log::info!(
            "backfill: config {} complete - {} threads queued, {} published",
            job.config_id,
            checkpoint.threads_queued,
            published
        );

        Ok(BackfillOutcome::Finished)
    }

    /// Publish every unpublished queued row of a configuration in one pass.
    async fn publish_queued_rows(&self, config_id: Uuid, inbox_id: Uuid) -> SyncResult<usize> {
        let rows = work_rows::unpublished_for_config(&self.pool, config_id).await?;
        let fallback_grant = inboxes::binding_for_config(&self.pool, config_id)
            .await?
            .map(|(_, _, grant)| grant)
            .filter(|grant| !grant.is_empty());

        let mut published = 0;
        for row in rows {
            if self
                .publish_row(&row, inbox_id, fallback_grant.as_deref())
                .await?
            {
                published += 1;
            }
        }

        Ok(published)
    }

    async fn publish_row(
        &self,
        row: &ThreadWorkRow,
        inbox_id: Uuid,
        fallback_grant: Option<&str>,
    ) -> SyncResult<bool> {
        let grant = if !row.grant_id.is_empty() {
            row.grant_id.clone()
        } else if let Some(grant) = fallback_grant {
            grant.to_string()
        } else {
            log::error!(
                "backfill: work row {}/{} has no grant and none is bound to the inbox",
                row.config_id,
                row.remote_thread_id
            );
            work_rows::mark_failed(
                &self.pool,
                row.config_id,
                &row.remote_thread_id,
                "no grant available for dispatch",
            )
            .await?;
            return Ok(false);
        };

        self.queue
            .enqueue(
                THREAD_SYNC_JOBS,
                &ThreadSyncJob {
                    thread_id: row.remote_thread_id.clone(),
                    grant_id: grant,
                    inbox_id,
                    config_id: row.config_id,
                },
            )
            .await?;
        work_rows::stamp_published(&self.pool, row.id).await?;
        Ok(true)
    }

    /// Publish queued-but-unpublished rows across all configurations.
    ///
    /// Recovers from a crash between work-row insertion and queue publication;
    /// runs once at startup, with bounded parallelism per configuration.
    pub async fn sweep_unpublished(&self) -> SyncResult<usize> {
        let config_ids = work_rows::configs_with_unpublished(&self.pool).await?;
        let mut total = 0;

        for config_id in config_ids {
            let binding = match inboxes::binding_for_config(&self.pool, config_id).await? {
                Some(binding) => binding,
                None => {
                    log::warn!(
                        "backfill: sweep found rows for config {} with no inbox binding, skipping",
                        config_id
                    );
                    continue;
                }
            };
            let (inbox_id, _tenant_id, grant) = binding;
            let fallback_grant = Some(grant).filter(|g| !g.is_empty());

            let rows = work_rows::unpublished_for_config(&self.pool, config_id).await?;
            let count = rows.len();

            let results: Vec<SyncResult<bool>> = futures::stream::iter(rows)
                .map(|row| {
                    let fallback = fallback_grant.clone();
                    async move { self.publish_row(&row, inbox_id, fallback.as_deref()).await }
                })
                .buffer_unordered(self.settings.publish_concurrency)
                .collect()
                .await;

            let mut published = 0;
            for result in results {
                match result {
                    Ok(true) => published += 1,
                    Ok(false) => {}
                    Err(e) => log::error!("backfill: sweep publish failed: {}", e),
                }
            }

            log::info!(
                "backfill: sweep published {}/{} rows for config {}",
                published,
                count,
                config_id
            );
            total += published;
        }

        Ok(total)
    }
}
