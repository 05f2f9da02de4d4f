use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::SyncResult;

/// Connect a pooled client to the progress store.
pub async fn connect_pool(database_url: &str) -> SyncResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations. Idempotent; already-applied migrations are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    log::info!("running database migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    log::info!("database migrations completed");
    Ok(())
}
