//! Configuration lifecycle and backfill checkpoint management.
//!
//! The checkpoint records `{last_page_token, threads_queued, current_page}` on
//! the configuration row after every page, so an interrupted backfill resumes
//! where it left off. It is cleared when the configuration completes.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::models::{BackfillCheckpoint, ConfigStatus};

pub async fn set_status(pool: &PgPool, config_id: Uuid, status: ConfigStatus) -> SyncResult<()> {
    sqlx::query("UPDATE sync_configs SET status = $1 WHERE id = $2")
        .bind(status.as_str())
        .bind(config_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn get_status(pool: &PgPool, config_id: Uuid) -> SyncResult<ConfigStatus> {
    let (status,): (String,) = sqlx::query_as("SELECT status FROM sync_configs WHERE id = $1")
        .bind(config_id)
        .fetch_one(pool)
        .await?;

    ConfigStatus::parse(&status)
        .ok_or_else(|| SyncError::payload(format!("unknown config status '{}'", status)))
}

/// Move a configuration into backfill and stamp the start of the sync.
pub async fn begin_backfill(pool: &PgPool, config_id: Uuid) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE sync_configs
           SET status = 'backfill',
               sync_started_at = COALESCE(sync_started_at, NOW()),
               sync_completed_at = NULL
           WHERE id = $1"#,
    )
    .bind(config_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn transition_to_thread_sync(pool: &PgPool, config_id: Uuid) -> SyncResult<()> {
    set_status(pool, config_id, ConfigStatus::ThreadSync).await
}

/// Close a configuration: status, completion stamp, checkpoint cleared.
pub async fn complete(pool: &PgPool, config_id: Uuid) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE sync_configs
           SET status = 'completed',
               sync_completed_at = NOW(),
               checkpoint = NULL
           WHERE id = $1"#,
    )
    .bind(config_id)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE sync_stats SET sync_completed_at = NOW() WHERE config_id = $1")
        .bind(config_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Record a backfill failure. The checkpoint body is preserved so a restart
/// can resume; only the error field is replaced.
pub async fn mark_failed(pool: &PgPool, config_id: Uuid, error: &str) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE sync_configs
           SET status = 'failed',
               checkpoint = jsonb_set(
                   COALESCE(checkpoint, '{}'::jsonb), '{error}', to_jsonb($2::text))
           WHERE id = $1"#,
    )
    .bind(config_id)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(())
}

/// Revert a prematurely-completed configuration back to thread_sync.
pub async fn revert_premature(pool: &PgPool, config_id: Uuid) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE sync_configs
           SET status = 'thread_sync', sync_completed_at = NULL
           WHERE id = $1"#,
    )
    .bind(config_id)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE sync_stats SET sync_completed_at = NULL WHERE config_id = $1")
        .bind(config_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn load_checkpoint(
    pool: &PgPool,
    config_id: Uuid,
) -> SyncResult<Option<BackfillCheckpoint>> {
    let row: Option<(Option<serde_json::Value>,)> =
        sqlx::query_as("SELECT checkpoint FROM sync_configs WHERE id = $1")
            .bind(config_id)
            .fetch_optional(pool)
            .await?;

    match row {
        Some((Some(value),)) => {
            let checkpoint = serde_json::from_value(value)?;
            Ok(Some(checkpoint))
        }
        _ => Ok(None),
    }
}

/// Persist the page checkpoint. `current_page` never moves backwards: a stale
/// writer racing a restart loses via `GREATEST` on the stored value.
pub async fn save_checkpoint(
    pool: &PgPool,
    config_id: Uuid,
    checkpoint: &BackfillCheckpoint,
) -> SyncResult<()> {
    let value = serde_json::to_value(checkpoint)?;
    sqlx::query(
        r#"UPDATE sync_configs
           SET checkpoint = jsonb_set(
               $2::jsonb,
               '{current_page}',
               to_jsonb(GREATEST(
                   ($2::jsonb->>'current_page')::int,
                   COALESCE((checkpoint->>'current_page')::int, 0))))
           WHERE id = $1"#,
    )
    .bind(config_id)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}

/// Configurations currently in an active sync phase.
pub async fn in_progress(pool: &PgPool) -> SyncResult<Vec<(Uuid, ConfigStatus)>> {
    let rows: Vec<(Uuid, String)> = sqlx::query_as(
        "SELECT id, status FROM sync_configs WHERE status IN ('backfill', 'thread_sync')",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(id, status)| ConfigStatus::parse(&status).map(|s| (id, s)))
        .collect())
}

/// Completed configurations that ran a sync, candidates for premature-completion
/// recovery.
pub async fn completed_with_history(pool: &PgPool) -> SyncResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM sync_configs WHERE status = 'completed' AND sync_started_at IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
