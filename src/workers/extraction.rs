//! Extraction pipeline: enqueuer and worker.
//!
//! The enqueuer discovers synced-but-unextracted threads, runs the optional
//! spam gate, and publishes jobs to `extraction_jobs` with a tracking row for
//! visibility. The worker composes a chronological transcript, calls the LLM
//! with the fixed extraction schema, and persists the versioned record.

use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ExtractionSettings, LlmSettings};
use crate::error::SyncResult;
use crate::llm::{self, LlmClient};
use crate::models::ExtractionState;
use crate::payloads::ExtractionJob;
use crate::queue::{JobQueue, QueueMessage, EXTRACTION_JOBS};
use crate::store::{extraction, threads};

const DEFAULT_PRIORITY: u8 = 50;

pub struct ExtractionEnqueuer {
    pool: PgPool,
    queue: JobQueue,
    llm: Arc<dyn LlmClient>,
    llm_settings: LlmSettings,
    settings: ExtractionSettings,
}

impl ExtractionEnqueuer {
    pub fn new(
        pool: PgPool,
        queue: JobQueue,
        llm: Arc<dyn LlmClient>,
        llm_settings: LlmSettings,
        settings: ExtractionSettings,
    ) -> Self {
        Self {
            pool,
            queue,
            llm,
            llm_settings,
            settings,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        log::info!("extraction: enqueuer started");

        let mut tick = tokio::time::interval(self.settings.enqueue_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match self.enqueue_batch().await {
                        Ok(0) => {}
                        Ok(count) => log::info!("extraction: enqueued {} threads", count),
                        Err(e) => log::error!("extraction: enqueue pass failed: {}", e),
                    }
                }
            }
        }

        log::info!("extraction: enqueuer stopped");
    }

    /// One discovery pass. Returns how many threads were published.
    pub async fn enqueue_batch(&self) -> SyncResult<usize> {
        let candidates = extraction::candidates(
            &self.pool,
            self.llm_settings.extraction_version,
            self.settings.enqueue_batch,
        )
        .await?;

        let mut enqueued = 0;
        for candidate in candidates {
            if self.llm_settings.spam_detection && !candidate.spam_checked {
                match self.spam_gate(candidate.thread_id).await {
                    Ok(true) => {
                        log::info!(
                            "extraction: thread {} flagged by spam gate, skipping",
                            candidate.thread_id
                        );
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        // The gate is advisory; a flaky classifier must not
                        // stall extraction.
                        log::warn!(
                            "extraction: spam check for thread {} failed, continuing: {}",
                            candidate.thread_id,
                            e
                        );
                    }
                }
            }

            if extraction::is_active(&self.pool, candidate.thread_id).await? {
                log::debug!(
                    "extraction: thread {} already queued, skipping",
                    candidate.thread_id
                );
                continue;
            }

            self.queue
                .enqueue(
                    EXTRACTION_JOBS,
                    &ExtractionJob {
                        thread_id: candidate.thread_id,
                        inbox_id: candidate.inbox_id,
                        tenant_id: candidate.tenant_id,
                        priority: DEFAULT_PRIORITY,
                    },
                )
                .await?;
            if !extraction::track_queued(&self.pool, candidate.thread_id).await? {
                log::debug!(
                    "extraction: tracking row for thread {} already present",
                    candidate.thread_id
                );
            }
            enqueued += 1;
        }

        Ok(enqueued)
    }

    /// Run the spam classifier; returns true when the thread should be skipped.
    async fn spam_gate(&self, thread_id: Uuid) -> SyncResult<bool> {
        let messages = threads::messages_chronological(&self.pool, thread_id).await?;
        let transcript = llm::compose_transcript(&messages);
        let verdict =
            llm::classify_spam(self.llm.as_ref(), &self.llm_settings, &transcript).await?;
        threads::record_spam_verdict(&self.pool, thread_id, &verdict).await?;
        Ok(verdict.should_skip())
    }
}

pub struct ExtractionWorker {
    pool: PgPool,
    queue: JobQueue,
    llm: Arc<dyn LlmClient>,
    llm_settings: LlmSettings,
    settings: ExtractionSettings,
    worker_id: usize,
}

impl ExtractionWorker {
    pub fn new(
        pool: PgPool,
        queue: JobQueue,
        llm: Arc<dyn LlmClient>,
        llm_settings: LlmSettings,
        settings: ExtractionSettings,
        worker_id: usize,
    ) -> Self {
        Self {
            pool,
            queue,
            llm,
            llm_settings,
            settings,
            worker_id,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        log::info!("extraction[{}]: worker started", self.worker_id);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let messages = match self
                .queue
                .read(EXTRACTION_JOBS, self.settings.visibility, 1)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    log::error!("extraction[{}]: queue read failed: {}", self.worker_id, e);
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
                if let Err(e) = self.process_message(&message).await {
                    log::error!(
                        "extraction[{}]: message {} processing failed: {}",
                        self.worker_id,
                        message.msg_id,
                        e
                    );
                }
            }
        }

        log::info!("extraction[{}]: worker stopped", self.worker_id);
    }

    pub async fn process_message(&self, message: &QueueMessage) -> SyncResult<()> {
        let job: ExtractionJob = match serde_json::from_value(message.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                log::error!(
                    "extraction[{}]: dropping malformed job {}: {}",
                    self.worker_id,
                    message.msg_id,
                    e
                );
                self.queue.delete(EXTRACTION_JOBS, message.msg_id).await?;
                return Ok(());
            }
        };

        if message.read_ct > self.settings.max_retries {
            log::error!(
                "extraction[{}]: thread {} exhausted {} retries, marking failed",
                self.worker_id,
                job.thread_id,
                self.settings.max_retries
            );
            extraction::set_state(&self.pool, job.thread_id, ExtractionState::Failed).await?;
            self.queue.delete(EXTRACTION_JOBS, message.msg_id).await?;
            return Ok(());
        }

        // Redelivery after a crash-post-persist: the record already exists.
        if extraction::has_record(
            &self.pool,
            job.thread_id,
            self.llm_settings.extraction_version,
        )
        .await?
        {
            extraction::set_state(&self.pool, job.thread_id, ExtractionState::Completed).await?;
            self.queue.delete(EXTRACTION_JOBS, message.msg_id).await?;
            return Ok(());
        }

        extraction::set_state(&self.pool, job.thread_id, ExtractionState::Processing).await?;

        match self.extract(job.thread_id).await {
            Ok(()) => {
                extraction::set_state(&self.pool, job.thread_id, ExtractionState::Completed)
                    .await?;
                self.queue.delete(EXTRACTION_JOBS, message.msg_id).await?;
                log::info!(
                    "extraction[{}]: thread {} extracted",
                    self.worker_id,
                    job.thread_id
                );
            }
            Err(e) if e.is_permanent() => {
                extraction::set_state(&self.pool, job.thread_id, ExtractionState::Failed).await?;
                self.queue.delete(EXTRACTION_JOBS, message.msg_id).await?;
                log::error!(
                    "extraction[{}]: thread {} failed permanently: {}",
                    self.worker_id,
                    job.thread_id,
                    e
                );
            }
            Err(e) => {
                extraction::set_state(&self.pool, job.thread_id, ExtractionState::Retrying).await?;
                // Not acked; the visibility timeout drives the retry.
                log::error!(
                    "extraction[{}]: thread {} failed (attempt {}): {}",
                    self.worker_id,
                    job.thread_id,
                    message.read_ct,
                    e
                );
            }
        }

        Ok(())
    }

    async fn extract(&self, thread_id: Uuid) -> SyncResult<()> {
        let messages = threads::messages_chronological(&self.pool, thread_id).await?;
        if messages.is_empty() {
            return Err(crate::error::SyncError::payload(format!(
                "thread {} has no messages to extract",
                thread_id
            )));
        }

        let transcript = llm::compose_transcript(&messages);
        let record =
            llm::extract_thread(self.llm.as_ref(), &self.llm_settings, &transcript).await?;

        extraction::insert_record(
            &self.pool,
            thread_id,
            self.llm_settings.extraction_version,
            &record,
        )
        .await?;
        threads::mark_messages_extracted(&self.pool, thread_id).await?;

        Ok(())
    }
}
