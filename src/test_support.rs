//! Helpers for integration tests: disposable Postgres databases and in-memory
//! provider/LLM fakes.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::llm::{GenerateRequest, LlmClient};
use crate::provider::{
    EmailProvider, ListThreadsParams, ProviderMessage, ProviderThread, ThreadPage,
};

pub use database::{TestDatabase, TestDatabaseError};

/// Convenience helpers for seeding configurations and inbox bindings in tests.
pub struct TestFixtures<'a> {
    pool: &'a sqlx::PgPool,
}

impl<'a> TestFixtures<'a> {
    pub fn new(pool: &'a sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Insert a configuration row with the given status, returning its id.
    pub async fn insert_config(&self, status: &str) -> Result<uuid::Uuid, sqlx::Error> {
        sqlx::query_scalar("INSERT INTO sync_configs (status) VALUES ($1) RETURNING id")
            .bind(status)
            .fetch_one(self.pool)
            .await
    }

    /// Bind an inbox with a grant to a configuration, returning the inbox id.
    pub async fn insert_inbox(
        &self,
        config_id: uuid::Uuid,
        grant_id: &str,
    ) -> Result<uuid::Uuid, sqlx::Error> {
        sqlx::query_scalar(
            r#"INSERT INTO inboxes (config_id, tenant_id, grant_id, email_address)
               VALUES ($1, $2, $3, $4)
               RETURNING id"#,
        )
        .bind(config_id)
        .bind(uuid::Uuid::new_v4())
        .bind(grant_id)
        .bind("support@example.com")
        .fetch_one(self.pool)
        .await
    }
}

pub mod database {
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use testcontainers_modules::postgres::Postgres;
    use testcontainers_modules::testcontainers::{
        core::error::TestcontainersError, runners::AsyncRunner, ContainerAsync, ImageExt,
    };
    use thiserror::Error;

    static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

    #[derive(Debug, Error)]
    pub enum TestDatabaseError {
        #[error("database error: {0}")]
        Sqlx(#[from] sqlx::Error),
        #[error("migration error: {0}")]
        Migration(#[from] sqlx::migrate::MigrateError),
        #[error("container error: {0}")]
        Container(#[from] TestcontainersError),
    }

    /// A migrated Postgres that lives exactly as long as one test.
    ///
    /// Every test gets its own container, so there is no shared server to
    /// protect: connect straight to the container's default database, run the
    /// migrations, and let container teardown reclaim everything. No per-test
    /// `CREATE DATABASE`, no forced drops on close.
    pub struct TestDatabase {
        pool: PgPool,
        container: ContainerAsync<Postgres>,
    }

    impl TestDatabase {
        pub async fn new() -> Result<Self, TestDatabaseError> {
            let container = Postgres::default().with_tag("16-alpine").start().await?;

            let host = container.get_host().await?;
            let port = container.get_host_port_ipv4(5432).await?;
            let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await?;

            MIGRATOR.run(&pool).await?;

            Ok(Self { pool, container })
        }

        pub fn pool(&self) -> &PgPool {
            &self.pool
        }

        pub fn pool_clone(&self) -> PgPool {
            self.pool.clone()
        }

        /// Disconnect and stop the container. Tests that skip this still get
        /// cleaned up when the container handle drops.
        pub async fn close(self) -> Result<(), TestDatabaseError> {
            self.pool.close().await;
            self.container.stop().await?;
            Ok(())
        }
    }
}

/// In-memory provider for worker-level tests. Threads are listed in insertion
/// order with offset-based page tokens.
#[derive(Default)]
pub struct FakeProvider {
    inner: Mutex<FakeProviderState>,
}

#[derive(Default)]
struct FakeProviderState {
    threads: Vec<ProviderThread>,
    messages: HashMap<String, Vec<ProviderMessage>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_thread(&self, thread: ProviderThread, messages: Vec<ProviderMessage>) {
        let mut inner = self.inner.lock().unwrap();
        inner.messages.insert(thread.id.clone(), messages);
        inner.threads.push(thread);
    }
}

#[async_trait]
impl EmailProvider for FakeProvider {
    async fn list_threads(
        &self,
        _grant_id: &str,
        params: &ListThreadsParams,
    ) -> SyncResult<ThreadPage> {
        let inner = self.inner.lock().unwrap();
        let matching: Vec<ProviderThread> = inner
            .threads
            .iter()
            .filter(|thread| {
                params.after_ts.map_or(true, |after| thread.latest_ts >= after)
                    && params
                        .before_ts
                        .map_or(true, |before| thread.latest_ts <= before)
            })
            .cloned()
            .collect();

        let offset: usize = params
            .page_token
            .as_deref()
            .and_then(|token| token.parse().ok())
            .unwrap_or(0);
        let limit = params.limit.max(1) as usize;

        let page: Vec<ProviderThread> =
            matching.iter().skip(offset).take(limit).cloned().collect();
        let next_offset = offset + page.len();
        let next_cursor = if next_offset < matching.len() {
            Some(next_offset.to_string())
        } else {
            None
        };

        Ok(ThreadPage {
            data: page,
            next_cursor,
        })
    }

    async fn find_thread(
        &self,
        _grant_id: &str,
        thread_id: &str,
    ) -> SyncResult<Option<ProviderThread>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .threads
            .iter()
            .find(|thread| thread.id == thread_id)
            .cloned())
    }

    async fn list_messages(
        &self,
        _grant_id: &str,
        thread_id: &str,
        limit: u32,
    ) -> SyncResult<Vec<ProviderMessage>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .get(thread_id)
            .map(|messages| messages.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn find_message(
        &self,
        _grant_id: &str,
        message_id: &str,
    ) -> SyncResult<Option<ProviderMessage>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .values()
            .flatten()
            .find(|message| message.id == message_id)
            .cloned())
    }
}

/// Canned-response LLM for extraction tests, keyed by schema name.
#[derive(Default)]
pub struct FakeLlm {
    responses: Mutex<HashMap<String, Value>>,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_response(&self, schema_name: &str, value: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(schema_name.to_string(), value);
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn generate_object(&self, request: &GenerateRequest) -> SyncResult<Value> {
        self.responses
            .lock()
            .unwrap()
            .get(&request.schema_name)
            .cloned()
            .ok_or(SyncError::EmptyLlmResponse)
    }
}
