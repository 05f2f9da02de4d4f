//! Inbox bindings: the authoritative mapping from configuration to remote
//! credential.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::SyncResult;

/// Resolve the grant bound to an inbox. Empty grants are treated as absent.
pub async fn grant_for_inbox(pool: &PgPool, inbox_id: Uuid) -> SyncResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT grant_id FROM inboxes WHERE id = $1")
        .bind(inbox_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|(grant,)| grant).filter(|grant| !grant.is_empty()))
}

/// The inbox bound to a configuration, with its grant.
pub async fn binding_for_config(
    pool: &PgPool,
    config_id: Uuid,
) -> SyncResult<Option<(Uuid, Uuid, String)>> {
    let row: Option<(Uuid, Uuid, String)> =
        sqlx::query_as("SELECT id, tenant_id, grant_id FROM inboxes WHERE config_id = $1")
            .bind(config_id)
            .fetch_optional(pool)
            .await?;

    Ok(row)
}

/// Flag every inbox using a grant as auth-expired.
pub async fn mark_grant_expired(pool: &PgPool, grant_id: &str) -> SyncResult<u64> {
    let result = sqlx::query(
        r#"UPDATE inboxes
           SET grant_status = 'expired', updated_at = NOW()
           WHERE grant_id = $1"#,
    )
    .bind(grant_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
