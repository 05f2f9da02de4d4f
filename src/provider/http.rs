//! HTTP implementation of the provider client.
//!
//! Transient failures are retried with exponential backoff inside a fixed
//! per-request timeout; 404 on point lookups maps to `Ok(None)`.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::time::{sleep, timeout};

use super::{
    EmailProvider, ListThreadsParams, ProviderMessage, ProviderThread, ThreadPage,
};
use crate::config::ProviderSettings;
use crate::error::{SyncError, SyncResult};

const PROVIDER_MAX_RETRIES: usize = 3;
const PROVIDER_RETRY_BACKOFF_MS: u64 = 500;
const PROVIDER_RETRY_BACKOFF_FACTOR: u64 = 2;

#[derive(Debug, Clone)]
pub struct HttpProvider {
    base_url: String,
    request_timeout: Duration,
    http: Client,
}

impl HttpProvider {
    pub fn new(settings: &ProviderSettings, http: Client) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            request_timeout: settings.request_timeout,
            http,
        }
    }

    async fn get_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> SyncResult<reqwest::Response> {
        let mut backoff_ms = PROVIDER_RETRY_BACKOFF_MS;
        let mut attempt = 1;
        loop {
            debug!(
                "provider: GET {} (attempt {} of {})",
                url, attempt, PROVIDER_MAX_RETRIES
            );

            let request = self.http.get(url).query(query).send();
            match timeout(self.request_timeout, request).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() || status == StatusCode::NOT_FOUND {
                        return Ok(response);
                    }
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "failed to read error body".to_string());
                    if attempt == PROVIDER_MAX_RETRIES || !retryable_status(status) {
                        return Err(SyncError::provider_status(status, body));
                    }
                    warn!(
                        "provider: attempt {} got status {}: {}",
                        attempt, status, body
                    );
                }
                Ok(Err(err)) => {
                    if attempt == PROVIDER_MAX_RETRIES {
                        return Err(SyncError::Http(err));
                    }
                    warn!("provider: attempt {} failed: {}", attempt, err);
                }
                Err(_) => {
                    if attempt == PROVIDER_MAX_RETRIES {
                        return Err(SyncError::Timeout(self.request_timeout));
                    }
                    warn!(
                        "provider: attempt {} timed out after {:?}",
                        attempt, self.request_timeout
                    );
                }
            }

            sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = backoff_ms.saturating_mul(PROVIDER_RETRY_BACKOFF_FACTOR);
            attempt += 1;
        }
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl EmailProvider for HttpProvider {
    async fn list_threads(
        &self,
        grant_id: &str,
        params: &ListThreadsParams,
    ) -> SyncResult<ThreadPage> {
        let url = format!("{}/v3/grants/{}/threads", self.base_url, grant_id);
        let mut query: Vec<(&str, String)> = vec![("limit", params.limit.to_string())];
        if let Some(after) = params.after_ts {
            query.push(("latest_message_after", after.to_string()));
        }
        if let Some(before) = params.before_ts {
            query.push(("latest_message_before", before.to_string()));
        }
        if let Some(token) = &params.page_token {
            query.push(("page_token", token.clone()));
        }

        let response = self.get_with_retry(&url, &query).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::provider_status(
                StatusCode::NOT_FOUND,
                "grant not found".to_string(),
            ));
        }
        let page = response.json::<ThreadPage>().await?;
        Ok(page)
    }

    async fn find_thread(
        &self,
        grant_id: &str,
        thread_id: &str,
    ) -> SyncResult<Option<ProviderThread>> {
        let url = format!(
            "{}/v3/grants/{}/threads/{}",
            self.base_url, grant_id, thread_id
        );
        let response = self.get_with_retry(&url, &[]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope = response.json::<DataEnvelope<ProviderThread>>().await?;
        Ok(Some(envelope.data))
    }

    async fn list_messages(
        &self,
        grant_id: &str,
        thread_id: &str,
        limit: u32,
    ) -> SyncResult<Vec<ProviderMessage>> {
        let url = format!("{}/v3/grants/{}/messages", self.base_url, grant_id);
        let query = vec![
            ("thread_id", thread_id.to_string()),
            ("limit", limit.to_string()),
        ];
        let response = self.get_with_retry(&url, &query).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let envelope = response.json::<DataEnvelope<Vec<ProviderMessage>>>().await?;
        Ok(envelope.data)
    }

    async fn find_message(
        &self,
        grant_id: &str,
        message_id: &str,
    ) -> SyncResult<Option<ProviderMessage>> {
        let url = format!(
            "{}/v3/grants/{}/messages/{}",
            self.base_url, grant_id, message_id
        );
        let response = self.get_with_retry(&url, &[]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope = response.json::<DataEnvelope<ProviderMessage>>().await?;
        Ok(Some(envelope.data))
    }
}

#[derive(serde::Deserialize)]
struct DataEnvelope<T> {
    data: T,
}
