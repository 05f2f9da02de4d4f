//! Sync stats: per-configuration counters for progress reporting.
//!
//! Workers bump counters incrementally with saturating arithmetic applied at
//! the storage layer (`GREATEST(x - 1, 0)`); the monitor periodically
//! overwrites the row with counts derived from the work-row table, which is
//! the source of truth. `threads_total` is only filled when the provider
//! reports a total, which it does not today; progress is computed over
//! `threads_queued`.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::models::SyncStatsRow;

/// Counts derived from the work-row table by a single grouped query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedStats {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub messages_synced: i64,
}

impl DerivedStats {
    /// Total work rows ever created for the configuration.
    pub fn total_rows(&self) -> i64 {
        self.queued + self.processing + self.completed + self.failed
    }

    /// True when every row is terminal and at least one row exists.
    pub fn is_complete(&self) -> bool {
        self.total_rows() > 0 && self.queued == 0 && self.processing == 0
    }
}

/// Create the stats row at backfill start if it does not exist.
pub async fn init(pool: &PgPool, config_id: Uuid) -> SyncResult<()> {
    sqlx::query(
        r#"INSERT INTO sync_stats (config_id, sync_started_at)
           VALUES ($1, NOW())
           ON CONFLICT (config_id) DO UPDATE
           SET sync_started_at = COALESCE(sync_stats.sync_started_at, NOW()),
               sync_completed_at = NULL"#,
    )
    .bind(config_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get(pool: &PgPool, config_id: Uuid) -> SyncResult<Option<SyncStatsRow>> {
    let row = sqlx::query_as::<_, SyncStatsRow>("SELECT * FROM sync_stats WHERE config_id = $1")
        .bind(config_id)
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

/// The orchestrator created `count` new work rows.
pub async fn record_queued(pool: &PgPool, config_id: Uuid, count: i32) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE sync_stats
           SET threads_queued = threads_queued + $2
           WHERE config_id = $1"#,
    )
    .bind(config_id)
    .bind(count)
    .execute(pool)
    .await?;

    Ok(())
}

/// A thread moved `queued -> processing`.
pub async fn record_claimed(pool: &PgPool, config_id: Uuid) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE sync_stats
           SET threads_processing = threads_processing + 1
           WHERE config_id = $1"#,
    )
    .bind(config_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// A thread finished; counters never go negative.
pub async fn record_completed(pool: &PgPool, config_id: Uuid, messages: i32) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE sync_stats
           SET threads_completed = threads_completed + 1,
               threads_processing = GREATEST(threads_processing - 1, 0),
               messages_synced = messages_synced + $2,
               last_thread_at = NOW()
           WHERE config_id = $1"#,
    )
    .bind(config_id)
    .bind(messages)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn record_failed(pool: &PgPool, config_id: Uuid) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE sync_stats
           SET threads_failed = threads_failed + 1,
               threads_processing = GREATEST(threads_processing - 1, 0),
               last_thread_at = NOW()
           WHERE config_id = $1"#,
    )
    .bind(config_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Derive counts for one configuration server-side. The grouped query avoids
/// pulling rows to the client, so large configurations never truncate.
pub async fn derive(pool: &PgPool, config_id: Uuid) -> SyncResult<DerivedStats> {
    let rows: Vec<(String, i64, i64)> = sqlx::query_as(
        r#"SELECT status, COUNT(*), COALESCE(SUM(messages_synced), 0)
           FROM thread_work
           WHERE config_id = $1
           GROUP BY status"#,
    )
    .bind(config_id)
    .fetch_all(pool)
    .await?;

    let mut derived = DerivedStats::default();
    for (status, count, messages) in rows {
        match status.as_str() {
            "queued" => derived.queued = count,
            "processing" => derived.processing = count,
            "completed" => {
                derived.completed = count;
                derived.messages_synced += messages;
            }
            "failed" => derived.failed = count,
            other => log::warn!("stats: ignoring unknown work status '{}'", other),
        }
    }

    Ok(derived)
}

/// Overwrite the stats row with derived counts.
pub async fn write_derived(
    pool: &PgPool,
    config_id: Uuid,
    derived: &DerivedStats,
) -> SyncResult<()> {
    sqlx::query(
        r#"INSERT INTO sync_stats
               (config_id, threads_queued, threads_processing, threads_completed,
                threads_failed, messages_synced, sync_started_at)
           VALUES ($1, $2, $3, $4, $5, $6, NOW())
           ON CONFLICT (config_id) DO UPDATE
           SET threads_queued = EXCLUDED.threads_queued,
               threads_processing = EXCLUDED.threads_processing,
               threads_completed = EXCLUDED.threads_completed,
               threads_failed = EXCLUDED.threads_failed,
               messages_synced = EXCLUDED.messages_synced"#,
    )
    .bind(config_id)
    .bind(derived.total_rows() as i32)
    .bind(derived.processing as i32)
    .bind(derived.completed as i32)
    .bind(derived.failed as i32)
    .bind(derived.messages_synced as i32)
    .execute(pool)
    .await?;

    Ok(())
}
