//! Durable queue substrate over Postgres.
//!
//! One table backs every logical queue. `read` claims up to `n` visible
//! messages with `FOR UPDATE SKIP LOCKED`, hides them for the visibility
//! window and bumps `read_ct`; an undeleted message reappears after the
//! window. Consumers are required to be idempotent and to treat
//! `read_ct > max_retries` as terminal.

use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;

use crate::error::SyncResult;

pub const INBOX_BACKFILL_JOBS: &str = "inbox_backfill_jobs";
pub const THREAD_SYNC_JOBS: &str = "thread_sync_jobs";
pub const WEBHOOK_NOTIFICATIONS: &str = "webhook_notifications";
pub const EXTRACTION_JOBS: &str = "extraction_jobs";

/// A claimed queue message. `read_ct` counts deliveries including this one.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a message, visible immediately.
    pub async fn enqueue<T: Serialize>(&self, queue: &str, payload: &T) -> SyncResult<i64> {
        let payload = serde_json::to_value(payload)?;
        let (msg_id,): (i64,) = sqlx::query_as(
            r#"INSERT INTO queue_messages (queue, payload)
               VALUES ($1, $2)
               RETURNING id"#,
        )
        .bind(queue)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(msg_id)
    }

    /// Claim up to `limit` visible messages, hiding each for `visibility`.
    pub async fn read(
        &self,
        queue: &str,
        visibility: Duration,
        limit: i64,
    ) -> SyncResult<Vec<QueueMessage>> {
        let rows: Vec<(i64, i32, serde_json::Value)> = sqlx::query_as(
            r#"WITH picked AS (
                   SELECT id FROM queue_messages
                   WHERE queue = $1 AND vt <= NOW()
                   ORDER BY id
                   LIMIT $2
                   FOR UPDATE SKIP LOCKED
               )
               UPDATE queue_messages m
               SET vt = NOW() + make_interval(secs => $3),
                   read_ct = m.read_ct + 1
               FROM picked
               WHERE m.id = picked.id
               RETURNING m.id, m.read_ct, m.payload"#,
        )
        .bind(queue)
        .bind(limit)
        .bind(visibility.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, payload)| QueueMessage {
                msg_id,
                read_ct,
                payload,
            })
            .collect())
    }

    /// Acknowledge a message. Returns false when the message was already gone.
    pub async fn delete(&self, queue: &str, msg_id: i64) -> SyncResult<bool> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE queue = $1 AND id = $2")
            .bind(queue)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Number of messages on a queue, visible or not.
    pub async fn depth(&self, queue: &str) -> SyncResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE queue = $1")
                .bind(queue)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Drop every message on a queue.
    pub async fn purge(&self, queue: &str) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE queue = $1")
            .bind(queue)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
