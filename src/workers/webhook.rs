//! Webhook notification consumer.
//!
//! Drains `webhook_notifications` and routes each event by type. Message
//! events reuse the same upsert path as the thread-sync worker, which fetches
//! unknown threads before inserting, so push-triggered and backfill-triggered
//! syncs can interleave freely.

use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::WebhookSettings;
use crate::error::{SyncError, SyncResult};
use crate::ingest;
use crate::payloads::{extract_object_id, WebhookKind, WebhookNotification};
use crate::provider::EmailProvider;
use crate::queue::{JobQueue, QueueMessage, WEBHOOK_NOTIFICATIONS};
use crate::store::{inboxes, notifications, threads};

pub struct WebhookConsumer {
    pool: PgPool,
    queue: JobQueue,
    provider: Arc<dyn EmailProvider>,
    settings: WebhookSettings,
}

impl WebhookConsumer {
    pub fn new(
        pool: PgPool,
        queue: JobQueue,
        provider: Arc<dyn EmailProvider>,
        settings: WebhookSettings,
    ) -> Self {
        Self {
            pool,
            queue,
            provider,
            settings,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        log::info!("webhook: consumer started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let messages = match self
                .queue
                .read(
                    WEBHOOK_NOTIFICATIONS,
                    self.settings.visibility,
                    self.settings.batch_size,
                )
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    log::error!("webhook: queue read failed: {}", e);
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
                        "webhook: message {} processing failed: {}",
                        message.msg_id,
                        e
                    );
                }
            }
        }

        log::info!("webhook: consumer stopped");
    }

    pub async fn process_message(&self, message: &QueueMessage) -> SyncResult<()> {
        let notification: WebhookNotification =
            match serde_json::from_value(message.payload.clone()) {
                Ok(notification) => notification,
                Err(e) => {
                    log::error!(
                        "webhook: dropping malformed notification {}: {}",
                        message.msg_id,
                        e
                    );
                    self.queue
                        .delete(WEBHOOK_NOTIFICATIONS, message.msg_id)
                        .await?;
                    return Ok(());
                }
            };

        notifications::record_received(&self.pool, &notification).await?;

        if message.read_ct > self.settings.max_retries {
            log::error!(
                "webhook: notification {} exhausted {} retries",
                notification.notification_id,
                self.settings.max_retries
            );
            notifications::mark_error(
                &self.pool,
                notification.notification_id,
                "webhook retries exhausted",
            )
            .await?;
            if self.settings.testing_mode {
                // Keep the exhausted message visible so the failure can be
                // inspected and replayed.
                log::debug!(
                    "webhook: testing mode, leaving exhausted notification {} for redelivery",
                    notification.notification_id
                );
            } else {
                self.queue
                    .delete(WEBHOOK_NOTIFICATIONS, message.msg_id)
                    .await?;
            }
            return Ok(());
        }

        match self.route(&notification).await {
            Ok(()) => {
                notifications::mark_processed(&self.pool, notification.notification_id).await?;
                self.queue
                    .delete(WEBHOOK_NOTIFICATIONS, message.msg_id)
                    .await?;
            }
            Err(e) if e.is_permanent() => {
                log::error!(
                    "webhook: notification {} failed permanently: {}",
                    notification.notification_id,
                    e
                );
                notifications::mark_error(&self.pool, notification.notification_id, &e.to_string())
                    .await?;
                self.queue
                    .delete(WEBHOOK_NOTIFICATIONS, message.msg_id)
                    .await?;
            }
            Err(e) => {
                // Not acked; the visibility timeout drives the retry.
                log::error!(
                    "webhook: notification {} failed (attempt {}): {}",
                    notification.notification_id,
                    message.read_ct,
                    e
                );
            }
        }

        Ok(())
    }

    async fn route(&self, notification: &WebhookNotification) -> SyncResult<()> {
        match WebhookKind::parse(&notification.notification_type) {
            WebhookKind::MessageCreated | WebhookKind::MessageUpdated => {
                let message_id = extract_object_id(&notification.payload).ok_or_else(|| {
                    SyncError::payload(format!(
                        "{} notification carries no message id",
                        notification.notification_type
                    ))
                })?;
                let grant = self.resolve_grant(notification).await?;
                ingest::sync_remote_message(
                    &self.pool,
                    self.provider.as_ref(),
                    &grant,
                    Some(notification.inbox_id),
                    message_id,
                )
                .await?;
                Ok(())
            }
            WebhookKind::ThreadReplied => {
                let thread_id = extract_object_id(&notification.payload).ok_or_else(|| {
                    SyncError::payload("thread.replied notification carries no thread id")
                })?;
                let grant = self.resolve_grant(notification).await?;
                match self.provider.find_thread(&grant, thread_id).await? {
                    Some(thread) => {
                        threads::upsert_thread(&self.pool, Some(notification.inbox_id), &thread)
                            .await?;
                    }
                    None => {
                        log::info!(
                            "webhook: replied thread {} no longer on provider, ignoring",
                            thread_id
                        );
                    }
                }
                Ok(())
            }
            WebhookKind::GrantExpired => {
                let updated =
                    inboxes::mark_grant_expired(&self.pool, &notification.grant_id).await?;
                log::warn!(
                    "webhook: grant {} expired, {} inboxes flagged",
                    notification.grant_id,
                    updated
                );
                Ok(())
            }
            WebhookKind::Unknown => {
                log::info!(
                    "webhook: unknown notification type '{}', acknowledging",
                    notification.notification_type
                );
                Ok(())
            }
        }
    }

    async fn resolve_grant(&self, notification: &WebhookNotification) -> SyncResult<String> {
        if !notification.grant_id.is_empty() {
            return Ok(notification.grant_id.clone());
        }
        inboxes::grant_for_inbox(&self.pool, notification.inbox_id)
            .await?
            .ok_or(SyncError::MissingGrant(notification.inbox_id))
    }
}
