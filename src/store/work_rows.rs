//! Per-thread work rows: the orchestrator's tracking records.
//!
//! A `(config_id, remote_thread_id)` pair has at most one row for all time.
//! Re-queueing an existing row resets its status and `queued_at`; it never
//! creates a second row and never nulls out a credential that the incoming
//! payload carries.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::models::{ThreadWorkRow, WorkStatus};

/// Insert-or-reset a work row as `queued`.
///
/// On conflict the stored grant survives unless the incoming payload brings a
/// non-empty one; an empty incoming grant must never erase a stored credential.
pub async fn upsert_queued(
    pool: &PgPool,
    config_id: Uuid,
    remote_thread_id: &str,
    grant_id: &str,
) -> SyncResult<()> {
    sqlx::query(
        r#"INSERT INTO thread_work (config_id, remote_thread_id, grant_id, status, queued_at)
           VALUES ($1, $2, $3, 'queued', NOW())
           ON CONFLICT (config_id, remote_thread_id) DO UPDATE
           SET status = 'queued',
               queued_at = NOW(),
               published_at = NULL,
               error = NULL,
               grant_id = CASE
                   WHEN EXCLUDED.grant_id <> '' THEN EXCLUDED.grant_id
                   ELSE thread_work.grant_id
               END"#,
    )
    .bind(config_id)
    .bind(remote_thread_id)
    .bind(grant_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get(
    pool: &PgPool,
    config_id: Uuid,
    remote_thread_id: &str,
) -> SyncResult<Option<ThreadWorkRow>> {
    let row = sqlx::query_as::<_, ThreadWorkRow>(
        "SELECT * FROM thread_work WHERE config_id = $1 AND remote_thread_id = $2",
    )
    .bind(config_id)
    .bind(remote_thread_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Claim a row for processing. Only `queued -> processing` transitions;
/// returns false when the row was already claimed or terminal.
pub async fn claim_processing(
    pool: &PgPool,
    config_id: Uuid,
    remote_thread_id: &str,
) -> SyncResult<bool> {
    let result = sqlx::query(
        r#"UPDATE thread_work
           SET status = 'processing', started_at = NOW()
           WHERE config_id = $1 AND remote_thread_id = $2 AND status = 'queued'"#,
    )
    .bind(config_id)
    .bind(remote_thread_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn mark_completed(
    pool: &PgPool,
    config_id: Uuid,
    remote_thread_id: &str,
    messages_synced: i32,
) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE thread_work
           SET status = 'completed', processed_at = NOW(), messages_synced = $3, error = NULL
           WHERE config_id = $1 AND remote_thread_id = $2"#,
    )
    .bind(config_id)
    .bind(remote_thread_id)
    .bind(messages_synced)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_failed(
    pool: &PgPool,
    config_id: Uuid,
    remote_thread_id: &str,
    error: &str,
) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE thread_work
           SET status = 'failed', processed_at = NOW(), error = $3
           WHERE config_id = $1 AND remote_thread_id = $2"#,
    )
    .bind(config_id)
    .bind(remote_thread_id)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn status_of(
    pool: &PgPool,
    config_id: Uuid,
    remote_thread_id: &str,
) -> SyncResult<Option<WorkStatus>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT status FROM thread_work WHERE config_id = $1 AND remote_thread_id = $2",
    )
    .bind(config_id)
    .bind(remote_thread_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|(status,)| WorkStatus::parse(&status)))
}

/// Queued rows for one configuration that were never published to the
/// thread-sync queue.
pub async fn unpublished_for_config(
    pool: &PgPool,
    config_id: Uuid,
) -> SyncResult<Vec<ThreadWorkRow>> {
    let rows = sqlx::query_as::<_, ThreadWorkRow>(
        r#"SELECT * FROM thread_work
           WHERE config_id = $1 AND status = 'queued' AND published_at IS NULL
           ORDER BY id"#,
    )
    .bind(config_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Configurations holding any unpublished queued rows; drives the startup sweep.
pub async fn configs_with_unpublished(pool: &PgPool) -> SyncResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"SELECT DISTINCT config_id FROM thread_work
           WHERE status = 'queued' AND published_at IS NULL"#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn stamp_published(pool: &PgPool, work_row_id: i64) -> SyncResult<()> {
    sqlx::query("UPDATE thread_work SET published_at = NOW() WHERE id = $1")
        .bind(work_row_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// (queued, processing) row counts for one configuration.
pub async fn pending_counts(pool: &PgPool, config_id: Uuid) -> SyncResult<(i64, i64)> {
    let (queued, processing): (i64, i64) = sqlx::query_as(
        r#"SELECT
               COUNT(*) FILTER (WHERE status = 'queued'),
               COUNT(*) FILTER (WHERE status = 'processing')
           FROM thread_work WHERE config_id = $1"#,
    )
    .bind(config_id)
    .fetch_one(pool)
    .await?;

    Ok((queued, processing))
}
