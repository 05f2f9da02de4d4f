//! HTTP implementation of the LLM client against an OpenAI-compatible
//! chat-completions endpoint with JSON-schema response format.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use super::{GenerateRequest, LlmClient};
use crate::config::LlmSettings;
use crate::error::{SyncError, SyncResult};

const LLM_MAX_RETRIES: usize = 3;
const LLM_RETRY_BACKOFF_MS: u64 = 1_000;
const LLM_RETRY_BACKOFF_FACTOR: u64 = 2;

#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
    http: Client,
}

impl HttpLlmClient {
    pub fn new(settings: &LlmSettings, http: Client) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            request_timeout: settings.request_timeout,
            http,
        }
    }

    async fn dispatch(&self, request: &GenerateRequest) -> SyncResult<Value> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: &request.schema_name,
                    schema: &request.schema,
                    strict: request.strict,
                },
            },
        };

        let mut builder = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(SyncError::llm_status(status, text));
        }

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(SyncError::EmptyLlmResponse)?;

        let object: Value = serde_json::from_str(&content)?;
        Ok(object)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate_object(&self, request: &GenerateRequest) -> SyncResult<Value> {
        let mut backoff_ms = LLM_RETRY_BACKOFF_MS;
        for attempt in 1..=LLM_MAX_RETRIES {
            debug!(
                "llm: generating '{}' with {} (attempt {} of {})",
                request.schema_name, request.model, attempt, LLM_MAX_RETRIES
            );

            match timeout(self.request_timeout, self.dispatch(request)).await {
                Ok(Ok(object)) => return Ok(object),
                Ok(Err(err)) => {
                    if attempt == LLM_MAX_RETRIES || !is_retryable(&err) {
                        return Err(err);
                    }
                    warn!("llm: attempt {} failed: {}", attempt, err);
                }
                Err(_) => {
                    if attempt == LLM_MAX_RETRIES {
                        return Err(SyncError::Timeout(self.request_timeout));
                    }
                    warn!(
                        "llm: attempt {} timed out after {:?}",
                        attempt, self.request_timeout
                    );
                }
            }

            sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = backoff_ms.saturating_mul(LLM_RETRY_BACKOFF_FACTOR);
        }

        Err(SyncError::Timeout(self.request_timeout))
    }
}

fn is_retryable(err: &SyncError) -> bool {
    match err {
        SyncError::LlmStatus { status, .. } => {
            status.is_server_error() || status.as_u16() == 429
        }
        SyncError::Http(_) => true,
        _ => false,
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat<'a>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: JsonSchemaFormat<'a>,
}

#[derive(Serialize)]
struct JsonSchemaFormat<'a> {
    name: &'a str,
    schema: &'a Value,
    strict: bool,
}

#[derive(serde::Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(serde::Deserialize)]
struct ChatChoiceMessage {
    content: String,
}
