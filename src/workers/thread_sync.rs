//! Thread-sync worker.
//!
//! Consumes `thread_sync_jobs`: fetches one thread and its messages from the
//! provider, lands them through the shared ingest path, and closes the work
//! row. Safe to run in parallel; every write is keyed by a remote id.

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ThreadSyncSettings;
use crate::error::SyncResult;
use crate::ingest;
use crate::models::WorkStatus;
use crate::payloads::ThreadSyncJob;
use crate::provider::EmailProvider;
use crate::queue::{JobQueue, QueueMessage, THREAD_SYNC_JOBS};
use crate::store::{inboxes, stats, work_rows};

pub struct ThreadSyncWorker {
    pool: PgPool,
    queue: JobQueue,
    provider: Arc<dyn EmailProvider>,
    settings: ThreadSyncSettings,
    api_delay: Duration,
    worker_id: usize,
}

impl ThreadSyncWorker {
    pub fn new(
        pool: PgPool,
        queue: JobQueue,
        provider: Arc<dyn EmailProvider>,
        settings: ThreadSyncSettings,
        api_delay: Duration,
        worker_id: usize,
    ) -> Self {
        Self {
            pool,
            queue,
            provider,
            settings,
            api_delay,
            worker_id,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        log::info!("thread-sync[{}]: worker started", self.worker_id);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let messages = match self
                .queue
                .read(
                    THREAD_SYNC_JOBS,
                    self.settings.visibility,
                    self.settings.batch_size,
                )
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    log::error!("thread-sync[{}]: queue read failed: {}", self.worker_id, e);
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
                if shutdown.is_cancelled() {
                    break;
                }
                if let Err(e) = self.process_message(&message).await {
                    log::error!(
                        "thread-sync[{}]: message {} processing failed: {}",
                        self.worker_id,
                        message.msg_id,
                        e
                    );
                }
                tokio::time::sleep(self.settings.thread_delay).await;
            }
        }

        log::info!("thread-sync[{}]: worker stopped", self.worker_id);
    }

    /// Process one claimed queue message end to end.
    pub async fn process_message(&self, message: &QueueMessage) -> SyncResult<()> {
        let job: ThreadSyncJob = match serde_json::from_value(message.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                log::error!(
                    "thread-sync[{}]: dropping malformed job {}: {}",
                    self.worker_id,
                    message.msg_id,
                    e
                );
                self.queue.delete(THREAD_SYNC_JOBS, message.msg_id).await?;
                return Ok(());
            }
        };

        if message.read_ct > self.settings.max_retries {
            log::error!(
                "thread-sync[{}]: thread {} exhausted {} retries, marking failed",
                self.worker_id,
                job.thread_id,
                self.settings.max_retries
            );
            work_rows::mark_failed(
                &self.pool,
                job.config_id,
                &job.thread_id,
                "sync retries exhausted",
            )
            .await?;
            stats::record_failed(&self.pool, job.config_id).await?;
            self.queue.delete(THREAD_SYNC_JOBS, message.msg_id).await?;
            return Ok(());
        }

        // The inbox binding is authoritative when the payload grant is empty.
        let grant = if job.grant_id.is_empty() {
            inboxes::grant_for_inbox(&self.pool, job.inbox_id).await?
        } else {
            Some(job.grant_id.clone())
        };
        let grant = match grant {
            Some(grant) => grant,
            None => {
                log::error!(
                    "thread-sync[{}]: thread {} has no usable grant, failing permanently",
                    self.worker_id,
                    job.thread_id
                );
                work_rows::mark_failed(
                    &self.pool,
                    job.config_id,
                    &job.thread_id,
                    "no grant bound to inbox",
                )
                .await?;
                stats::record_failed(&self.pool, job.config_id).await?;
                self.queue.delete(THREAD_SYNC_JOBS, message.msg_id).await?;
                return Ok(());
            }
        };

        match work_rows::status_of(&self.pool, job.config_id, &job.thread_id).await? {
            Some(WorkStatus::Completed) | Some(WorkStatus::Failed) => {
                // Redelivered after the row closed; acknowledging is enough.
                log::debug!(
                    "thread-sync[{}]: thread {} already terminal, acking",
                    self.worker_id,
                    job.thread_id
                );
                self.queue.delete(THREAD_SYNC_JOBS, message.msg_id).await?;
                return Ok(());
            }
            None => {
                // Job without a work row (direct dispatch); create one so the
                // monitor can account for it.
                work_rows::upsert_queued(&self.pool, job.config_id, &job.thread_id, &grant)
                    .await?;
                if work_rows::claim_processing(&self.pool, job.config_id, &job.thread_id).await? {
                    stats::record_claimed(&self.pool, job.config_id).await?;
                }
            }
            Some(WorkStatus::Queued) => {
                if work_rows::claim_processing(&self.pool, job.config_id, &job.thread_id).await? {
                    stats::record_claimed(&self.pool, job.config_id).await?;
                }
            }
            Some(WorkStatus::Processing) => {
                // Redelivery of an in-flight row after a worker crash; the
                // upserts below are idempotent, so just continue.
            }
        }

        match self.sync_thread(&job, &grant).await {
            Ok(messages_synced) => {
                work_rows::mark_completed(
                    &self.pool,
                    job.config_id,
                    &job.thread_id,
                    messages_synced,
                )
                .await?;
                stats::record_completed(&self.pool, job.config_id, messages_synced).await?;
                self.queue.delete(THREAD_SYNC_JOBS, message.msg_id).await?;
                log::info!(
                    "thread-sync[{}]: thread {} complete - {} messages",
                    self.worker_id,
                    job.thread_id,
                    messages_synced
                );
            }
            Err(e) if e.is_permanent() => {
                work_rows::mark_failed(&self.pool, job.config_id, &job.thread_id, &e.to_string())
                    .await?;
                stats::record_failed(&self.pool, job.config_id).await?;
                self.queue.delete(THREAD_SYNC_JOBS, message.msg_id).await?;
                log::error!(
                    "thread-sync[{}]: thread {} failed permanently: {}",
                    self.worker_id,
                    job.thread_id,
                    e
                );
            }
            Err(e) => {
                // Not acked; the visibility timeout drives the retry.
                log::error!(
                    "thread-sync[{}]: thread {} failed (attempt {}): {}",
                    self.worker_id,
                    job.thread_id,
                    message.read_ct,
                    e
                );
            }
        }

        Ok(())
    }

    /// Fetch and persist the thread plus all its messages, returning how many
    /// messages the provider reported.
    async fn sync_thread(&self, job: &ThreadSyncJob, grant: &str) -> SyncResult<i32> {
        let thread = self.provider.find_thread(grant, &job.thread_id).await?;
        let thread = match thread {
            Some(thread) => thread,
            None => {
                log::info!(
                    "thread-sync[{}]: thread {} not found on provider, closing empty",
                    self.worker_id,
                    job.thread_id
                );
                return Ok(0);
            }
        };

        crate::store::threads::upsert_thread(&self.pool, Some(job.inbox_id), &thread).await?;
        tokio::time::sleep(self.api_delay).await;

        let messages = self
            .provider
            .list_messages(grant, &job.thread_id, self.settings.message_cap)
            .await?;

        let mut synced = 0i32;
        let mut failures = 0;
        for message in &messages {
            match ingest::upsert_message(
                &self.pool,
                self.provider.as_ref(),
                grant,
                Some(job.inbox_id),
                message,
            )
            .await
            {
                Ok(_) => synced += 1,
                Err(e) => {
                    failures += 1;
                    log::warn!(
                        "thread-sync[{}]: message {} in thread {} failed: {}",
                        self.worker_id,
                        message.id,
                        job.thread_id,
                        e
                    );
                }
            }
            tokio::time::sleep(self.settings.message_delay).await;
        }

        if failures > 0 {
            log::warn!(
                "thread-sync[{}]: thread {} synced with {} message failures",
                self.worker_id,
                job.thread_id,
                failures
            );
        }

        Ok(synced)
    }
}
