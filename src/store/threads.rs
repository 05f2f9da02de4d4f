//! Idempotent persistence of threads and messages, keyed by remote identifiers.
//!
//! Local UUIDs are incidental; a remote id maps to at most one row no matter
//! how many workers race on it.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::llm::SpamVerdict;
use crate::provider::{ProviderMessage, ProviderThread};

pub async fn thread_id_by_remote(
    pool: &PgPool,
    remote_thread_id: &str,
) -> SyncResult<Option<Uuid>> {
    let row: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM threads WHERE remote_thread_id = $1")
            .bind(remote_thread_id)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(id,)| id))
}

/// Which of the given remote thread ids already exist locally. One query per
/// page keeps the orchestrator's existence check off the row-at-a-time path.
pub async fn existing_remote_ids(
    pool: &PgPool,
    remote_ids: &[String],
) -> SyncResult<HashSet<String>> {
    if remote_ids.is_empty() {
        return Ok(HashSet::new());
    }

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT remote_thread_id FROM threads WHERE remote_thread_id = ANY($1)",
    )
    .bind(remote_ids)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Insert-or-update a thread from provider metadata, returning the local id.
pub async fn upsert_thread(
    pool: &PgPool,
    inbox_id: Option<Uuid>,
    thread: &ProviderThread,
) -> SyncResult<Uuid> {
    let participants = serde_json::to_value(&thread.participants)?;
    let last_message_at: Option<DateTime<Utc>> =
        DateTime::<Utc>::from_timestamp(thread.latest_ts, 0);

    let (id,): (Uuid,) = sqlx::query_as(
        r#"INSERT INTO threads
               (remote_thread_id, inbox_id, subject, participants, last_message_at,
                unread, starred, updated_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
           ON CONFLICT (remote_thread_id) DO UPDATE
           SET subject = EXCLUDED.subject,
               participants = EXCLUDED.participants,
               last_message_at = EXCLUDED.last_message_at,
               unread = EXCLUDED.unread,
               starred = EXCLUDED.starred,
               inbox_id = COALESCE(threads.inbox_id, EXCLUDED.inbox_id),
               updated_at = NOW()
           RETURNING id"#,
    )
    .bind(&thread.id)
    .bind(inbox_id)
    .bind(&thread.subject)
    .bind(participants)
    .bind(last_message_at)
    .bind(thread.unread)
    .bind(thread.starred)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

pub async fn message_exists(pool: &PgPool, remote_message_id: &str) -> SyncResult<bool> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM messages WHERE remote_message_id = $1")
            .bind(remote_message_id)
            .fetch_one(pool)
            .await?;

    Ok(count > 0)
}

/// Insert a message under an existing local thread. A concurrent insert of the
/// same remote id is absorbed by the conflict clause.
pub async fn insert_message(
    pool: &PgPool,
    thread_id: Uuid,
    message: &ProviderMessage,
) -> SyncResult<()> {
    let from_addrs = serde_json::to_value(&message.from_addrs)?;
    let to_addrs = serde_json::to_value(&message.to_addrs)?;

    sqlx::query(
        r#"INSERT INTO messages
               (id, remote_message_id, thread_id, remote_thread_id, from_addr, to_addrs,
                subject, snippet, body_text, sent_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
           ON CONFLICT (remote_message_id) DO NOTHING"#,
    )
    .bind(Uuid::new_v4())
    .bind(&message.id)
    .bind(thread_id)
    .bind(&message.thread_id)
    .bind(from_addrs)
    .bind(to_addrs)
    .bind(&message.subject)
    .bind(&message.snippet)
    .bind(&message.body)
    .bind(message.sent_at())
    .execute(pool)
    .await?;

    Ok(())
}

/// Messages of a thread in chronological order, for transcript composition.
pub async fn messages_chronological(
    pool: &PgPool,
    thread_id: Uuid,
) -> SyncResult<Vec<StoredMessage>> {
    let rows = sqlx::query_as::<_, StoredMessage>(
        r#"SELECT id, remote_message_id, subject, snippet, body_text, from_addr, sent_at
           FROM messages
           WHERE thread_id = $1
           ORDER BY sent_at ASC NULLS LAST, created_at ASC"#,
    )
    .bind(thread_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredMessage {
    pub id: Uuid,
    pub remote_message_id: String,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub from_addr: serde_json::Value,
    pub sent_at: Option<DateTime<Utc>>,
}

pub async fn record_spam_verdict(
    pool: &PgPool,
    thread_id: Uuid,
    verdict: &SpamVerdict,
) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE threads
           SET is_spam = $2, is_promotional = $3, spam_confidence = $4,
               spam_checked_at = NOW(), updated_at = NOW()
           WHERE id = $1"#,
    )
    .bind(thread_id)
    .bind(verdict.is_spam)
    .bind(verdict.is_promotional)
    .bind(verdict.confidence)
    .execute(pool)
    .await?;

    Ok(())
}

/// Flag every message of a thread as extracted.
pub async fn mark_messages_extracted(pool: &PgPool, thread_id: Uuid) -> SyncResult<u64> {
    let result = sqlx::query(
        "UPDATE messages SET extraction_status = 'completed' WHERE thread_id = $1",
    )
    .bind(thread_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
