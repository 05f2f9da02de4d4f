//! The shared message upsert path.
//!
//! Both the thread-sync worker and the webhook consumer land messages through
//! here: a message that already exists locally is skipped; a message whose
//! thread is unknown pulls the thread from the provider first. The unique keys
//! on remote ids make interleaved backfill and webhook syncs safe.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::provider::{EmailProvider, ProviderMessage};
use crate::store::threads;

/// Persist one provider message, creating its thread locally if needed.
///
/// Returns true when the message row was inserted, false when it already
/// existed.
pub async fn upsert_message(
    pool: &PgPool,
    provider: &dyn EmailProvider,
    grant_id: &str,
    inbox_id: Option<Uuid>,
    message: &ProviderMessage,
) -> SyncResult<bool> {
    if threads::message_exists(pool, &message.id).await? {
        log::debug!("ingest: message {} already exists, skipping", message.id);
        return Ok(false);
    }

    let thread_id = match threads::thread_id_by_remote(pool, &message.thread_id).await? {
        Some(id) => id,
        None => {
            let remote_thread = provider
                .find_thread(grant_id, &message.thread_id)
                .await?
                .ok_or_else(|| {
                    SyncError::payload(format!(
                        "message {} references unknown thread {}",
                        message.id, message.thread_id
                    ))
                })?;
            threads::upsert_thread(pool, inbox_id, &remote_thread).await?
        }
    };

    threads::insert_message(pool, thread_id, message).await?;
    Ok(true)
}

/// Fetch a message by remote id and land it through the shared path.
pub async fn sync_remote_message(
    pool: &PgPool,
    provider: &dyn EmailProvider,
    grant_id: &str,
    inbox_id: Option<Uuid>,
    remote_message_id: &str,
) -> SyncResult<bool> {
    if threads::message_exists(pool, remote_message_id).await? {
        log::info!(
            "ingest: message {} already exists, skipping",
            remote_message_id
        );
        return Ok(false);
    }

    let message = provider
        .find_message(grant_id, remote_message_id)
        .await?
        .ok_or_else(|| {
            SyncError::payload(format!(
                "message {} not found on provider",
                remote_message_id
            ))
        })?;

    upsert_message(pool, provider, grant_id, inbox_id, &message).await
}
