//! Remote email provider client: the request/response seam the sync workers
//! consume. Provider dates are epoch seconds.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default)]
    pub name: Option<String>,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderThread {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    /// Epoch seconds of the latest message.
    #[serde(default)]
    pub latest_ts: i64,
    #[serde(default)]
    pub unread: bool,
    #[serde(default)]
    pub starred: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, rename = "from")]
    pub from_addrs: Vec<Participant>,
    #[serde(default)]
    pub to_addrs: Vec<Participant>,
    /// Epoch seconds.
    #[serde(default)]
    pub date: i64,
}

impl ProviderMessage {
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.date, 0)
    }
}

/// One page of the thread listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadPage {
    pub data: Vec<ProviderThread>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListThreadsParams {
    pub limit: u32,
    pub after_ts: Option<i64>,
    pub before_ts: Option<i64>,
    pub page_token: Option<String>,
}

/// The provider operations the pipeline depends on. Workers take this as an
/// injected dependency; tests swap in an in-memory fake.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn list_threads(
        &self,
        grant_id: &str,
        params: &ListThreadsParams,
    ) -> SyncResult<ThreadPage>;

    /// `Ok(None)` when the thread no longer exists on the provider.
    async fn find_thread(&self, grant_id: &str, thread_id: &str)
        -> SyncResult<Option<ProviderThread>>;

    async fn list_messages(
        &self,
        grant_id: &str,
        thread_id: &str,
        limit: u32,
    ) -> SyncResult<Vec<ProviderMessage>>;

    async fn find_message(
        &self,
        grant_id: &str,
        message_id: &str,
    ) -> SyncResult<Option<ProviderMessage>>;
}
