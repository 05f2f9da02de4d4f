use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that occur while moving work between queues, the database, and the
/// external provider/LLM clients.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {status}: {body}")]
    ProviderStatus { status: StatusCode, body: String },
    #[error("llm returned status {status}: {body}")]
    LlmStatus { status: StatusCode, body: String },
    #[error("llm response did not include a structured object")]
    EmptyLlmResponse,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error("no grant bound to inbox {0}")]
    MissingGrant(Uuid),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SyncError {
    pub fn provider_status(status: StatusCode, body: String) -> Self {
        SyncError::ProviderStatus { status, body }
    }

    pub fn llm_status(status: StatusCode, body: String) -> Self {
        SyncError::LlmStatus { status, body }
    }

    pub fn payload(msg: impl Into<String>) -> Self {
        SyncError::Payload(msg.into())
    }

    /// Payload and credential errors never succeed on redelivery; everything
    /// else is worth another visibility cycle.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SyncError::Payload(_) | SyncError::MissingGrant(_))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
