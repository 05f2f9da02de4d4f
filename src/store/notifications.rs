//! Webhook notification audit rows.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::payloads::WebhookNotification;

/// Record (or refresh) the audit row for an incoming notification.
pub async fn record_received(pool: &PgPool, notification: &WebhookNotification) -> SyncResult<()> {
    sqlx::query(
        r#"INSERT INTO notifications
               (id, webhook_id, inbox_id, notification_type, grant_id, payload,
                status, received_at)
           VALUES ($1, $2, $3, $4, $5, $6, 'received', $7)
           ON CONFLICT (id) DO NOTHING"#,
    )
    .bind(notification.notification_id)
    .bind(&notification.webhook_id)
    .bind(notification.inbox_id)
    .bind(&notification.notification_type)
    .bind(&notification.grant_id)
    .bind(&notification.payload)
    .bind(notification.received_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_processed(pool: &PgPool, notification_id: Uuid) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE notifications
           SET status = 'processed', processed_at = NOW(), error = NULL
           WHERE id = $1"#,
    )
    .bind(notification_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_error(pool: &PgPool, notification_id: Uuid, error: &str) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE notifications
           SET status = 'error', processed_at = NOW(), error = $2
           WHERE id = $1"#,
    )
    .bind(notification_id)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(())
}
