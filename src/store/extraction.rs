//! Extraction tracking rows and versioned extraction records.
//!
//! The durable queue is authoritative for extraction work; the tracking table
//! exists for visibility and duplicate suppression only.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::llm::ThreadExtraction;
use crate::models::ExtractionState;

/// A thread eligible for extraction.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExtractionCandidate {
    pub thread_id: Uuid,
    pub inbox_id: Uuid,
    pub tenant_id: Uuid,
    /// Whether the spam gate already ran for this thread.
    pub spam_checked: bool,
}

/// Threads that have messages but no extraction record at the given version,
/// skipping threads already flagged spam or promotional.
pub async fn candidates(
    pool: &PgPool,
    version: i32,
    limit: i64,
) -> SyncResult<Vec<ExtractionCandidate>> {
    let rows = sqlx::query_as::<_, ExtractionCandidate>(
        r#"SELECT t.id AS thread_id, i.id AS inbox_id, i.tenant_id,
                  (t.spam_checked_at IS NOT NULL) AS spam_checked
           FROM threads t
           JOIN inboxes i ON i.id = t.inbox_id
           WHERE EXISTS (SELECT 1 FROM messages m WHERE m.thread_id = t.id)
             AND NOT EXISTS (
                 SELECT 1 FROM thread_extractions e
                 WHERE e.thread_id = t.id AND e.extraction_version = $1)
             AND COALESCE(t.is_spam, FALSE) = FALSE
             AND COALESCE(t.is_promotional, FALSE) = FALSE
           ORDER BY t.updated_at ASC
           LIMIT $2"#,
    )
    .bind(version)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Whether the thread is already queued, processing or retrying.
pub async fn is_active(pool: &PgPool, thread_id: Uuid) -> SyncResult<bool> {
    let (count,): (i64,) = sqlx::query_as(
        r#"SELECT COUNT(*) FROM extraction_queue
           WHERE thread_id = $1 AND status IN ('queued', 'processing', 'retrying')"#,
    )
    .bind(thread_id)
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

/// Insert a tracking row for a freshly-enqueued thread. A duplicate insert is
/// a successful skip, not an error.
pub async fn track_queued(pool: &PgPool, thread_id: Uuid) -> SyncResult<bool> {
    let result = sqlx::query(
        r#"INSERT INTO extraction_queue (thread_id, status)
           VALUES ($1, 'queued')
           ON CONFLICT (thread_id) DO UPDATE
           SET status = 'queued', attempts = 0, queued_at = NOW(), updated_at = NOW()
           WHERE extraction_queue.status IN ('completed', 'failed')"#,
    )
    .bind(thread_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn set_state(pool: &PgPool, thread_id: Uuid, state: ExtractionState) -> SyncResult<()> {
    sqlx::query(
        r#"UPDATE extraction_queue
           SET status = $2,
               attempts = attempts + CASE WHEN $2 IN ('processing', 'retrying') THEN 1 ELSE 0 END,
               updated_at = NOW()
           WHERE thread_id = $1"#,
    )
    .bind(thread_id)
    .bind(state.as_str())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn has_record(pool: &PgPool, thread_id: Uuid, version: i32) -> SyncResult<bool> {
    let (count,): (i64,) = sqlx::query_as(
        r#"SELECT COUNT(*) FROM thread_extractions
           WHERE thread_id = $1 AND extraction_version = $2"#,
    )
    .bind(thread_id)
    .bind(version)
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

/// Persist the structured record and its flattened entities. Re-running for
/// the same `(thread_id, version)` replaces the record in place.
pub async fn insert_record(
    pool: &PgPool,
    thread_id: Uuid,
    version: i32,
    extraction: &ThreadExtraction,
) -> SyncResult<Uuid> {
    let mut tx = pool.begin().await?;

    let (extraction_id,): (Uuid,) = sqlx::query_as(
        r#"INSERT INTO thread_extractions
               (thread_id, extraction_version, summary, intent, urgency, sentiment,
                needs_reply, actionability, scores, classification, tasks, risks,
                keywords, participants, project, message_type, is_reply, is_forward,
                reading_time_seconds)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                   $15, $16, $17, $18, $19)
           ON CONFLICT (thread_id, extraction_version) DO UPDATE
           SET summary = EXCLUDED.summary,
               intent = EXCLUDED.intent,
               urgency = EXCLUDED.urgency,
               sentiment = EXCLUDED.sentiment,
               needs_reply = EXCLUDED.needs_reply,
               actionability = EXCLUDED.actionability,
               scores = EXCLUDED.scores,
               classification = EXCLUDED.classification,
               tasks = EXCLUDED.tasks,
               risks = EXCLUDED.risks,
               keywords = EXCLUDED.keywords,
               participants = EXCLUDED.participants,
               project = EXCLUDED.project,
               message_type = EXCLUDED.message_type,
               is_reply = EXCLUDED.is_reply,
               is_forward = EXCLUDED.is_forward,
               reading_time_seconds = EXCLUDED.reading_time_seconds
           RETURNING id"#,
    )
    .bind(thread_id)
    .bind(version)
    .bind(&extraction.summary)
    .bind(&extraction.intent)
    .bind(&extraction.urgency)
    .bind(&extraction.sentiment)
    .bind(extraction.needs_reply)
    .bind(&extraction.actionability)
    .bind(serde_json::to_value(&extraction.scores)?)
    .bind(serde_json::to_value(&extraction.classification)?)
    .bind(serde_json::to_value(&extraction.tasks)?)
    .bind(serde_json::to_value(&extraction.risks)?)
    .bind(serde_json::to_value(&extraction.keywords)?)
    .bind(serde_json::to_value(&extraction.participants)?)
    .bind(&extraction.project)
    .bind(&extraction.message_type)
    .bind(extraction.is_reply)
    .bind(extraction.is_forward)
    .bind(extraction.reading_time_seconds as i32)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM extraction_entities WHERE extraction_id = $1")
        .bind(extraction_id)
        .execute(&mut *tx)
        .await?;

    for entity in &extraction.entities {
        sqlx::query(
            "INSERT INTO extraction_entities (extraction_id, kind, value) VALUES ($1, $2, $3)",
        )
        .bind(extraction_id)
        .bind(&entity.kind)
        .bind(&entity.value)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(extraction_id)
}
