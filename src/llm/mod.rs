//! LLM inference client: spam gating and structured thread extraction.
//!
//! The trait exposes one generic operation, `generate_object`, which returns a
//! JSON value validated against a caller-supplied schema. Typed wrappers here
//! own the schemas and the prompt composition.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::LlmSettings;
use crate::error::SyncResult;
use crate::store::threads::StoredMessage;

/// A structured-generation request. `strict` asks the backend to enforce the
/// schema rather than treat it as a hint.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub schema_name: String,
    pub schema: Value,
    pub prompt: String,
    pub temperature: f32,
    pub strict: bool,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate_object(&self, request: &GenerateRequest) -> SyncResult<Value>;
}

/// Spam/promotional gate verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamVerdict {
    pub is_spam: bool,
    pub is_promotional: bool,
    pub confidence: f32,
    pub reasoning: String,
}

impl SpamVerdict {
    pub fn should_skip(&self) -> bool {
        self.is_spam || self.is_promotional
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionScores {
    #[serde(default)]
    pub importance: f32,
    #[serde(default)]
    pub urgency: f32,
    #[serde(default)]
    pub sentiment: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTask {
    pub description: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub kind: String,
    pub value: String,
}

/// The structured record extracted from a thread transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadExtraction {
    pub summary: String,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub needs_reply: bool,
    #[serde(default)]
    pub actionability: Option<String>,
    #[serde(default)]
    pub scores: ExtractionScores,
    #[serde(default)]
    pub classification: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<ExtractedTask>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub is_reply: bool,
    #[serde(default)]
    pub is_forward: bool,
    #[serde(default)]
    pub reading_time_seconds: u32,
}

pub fn spam_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "is_spam": { "type": "boolean" },
            "is_promotional": { "type": "boolean" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "reasoning": { "type": "string" }
        },
        "required": ["is_spam", "is_promotional", "confidence", "reasoning"],
        "additionalProperties": false
    })
}

pub fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "intent": { "type": "string" },
            "urgency": { "type": "string", "enum": ["low", "medium", "high", "critical"] },
            "sentiment": { "type": "string", "enum": ["negative", "neutral", "positive"] },
            "needs_reply": { "type": "boolean" },
            "actionability": { "type": "string" },
            "scores": {
                "type": "object",
                "properties": {
                    "importance": { "type": "number" },
                    "urgency": { "type": "number" },
                    "sentiment": { "type": "number" }
                },
                "required": ["importance", "urgency", "sentiment"],
                "additionalProperties": false
            },
            "classification": { "type": "array", "items": { "type": "string" } },
            "tasks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "description": { "type": "string" },
                        "owner": { "type": ["string", "null"] },
                        "due_date": { "type": ["string", "null"] }
                    },
                    "required": ["description"],
                    "additionalProperties": false
                }
            },
            "risks": { "type": "array", "items": { "type": "string" } },
            "keywords": { "type": "array", "items": { "type": "string" } },
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "kind": { "type": "string" },
                        "value": { "type": "string" }
                    },
                    "required": ["kind", "value"],
                    "additionalProperties": false
                }
            },
            "participants": { "type": "array", "items": { "type": "string" } },
            "project": { "type": ["string", "null"] },
            "message_type": { "type": "string" },
            "is_reply": { "type": "boolean" },
            "is_forward": { "type": "boolean" },
            "reading_time_seconds": { "type": "integer", "minimum": 0 }
        },
        "required": ["summary", "needs_reply"],
        "additionalProperties": true
    })
}

/// Flatten stored messages into a transcript for the prompts, oldest first.
pub fn compose_transcript(messages: &[StoredMessage]) -> String {
    let mut transcript = String::new();
    for message in messages {
        let sender = message
            .from_addr
            .pointer("/0/email")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let sent = message
            .sent_at
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "unknown time".to_string());
        let body = message
            .body_text
            .as_deref()
            .or(message.snippet.as_deref())
            .unwrap_or("");

        transcript.push_str(&format!(
            "From: {}\nDate: {}\nSubject: {}\n\n{}\n\n---\n\n",
            sender,
            sent,
            message.subject.as_deref().unwrap_or("(no subject)"),
            body
        ));
    }
    transcript
}

/// Run the spam gate over a transcript.
pub async fn classify_spam(
    client: &dyn LlmClient,
    settings: &LlmSettings,
    transcript: &str,
) -> SyncResult<SpamVerdict> {
    let request = GenerateRequest {
        model: settings.spam_model.clone(),
        schema_name: "spam_verdict".to_string(),
        schema: spam_schema(),
        prompt: format!(
            "Decide whether the following email thread is spam or promotional \
             bulk mail. Support threads from real customers are neither.\n\n{}",
            transcript
        ),
        temperature: 0.0,
        strict: true,
    };

    let value = client.generate_object(&request).await?;
    let verdict = serde_json::from_value(value)?;
    Ok(verdict)
}

/// Extract the structured record for a thread transcript.
pub async fn extract_thread(
    client: &dyn LlmClient,
    settings: &LlmSettings,
    transcript: &str,
) -> SyncResult<ThreadExtraction> {
    let request = GenerateRequest {
        model: settings.model.clone(),
        schema_name: "thread_extraction".to_string(),
        schema: extraction_schema(),
        prompt: format!(
            "You are analyzing a support inbox email thread. Read the \
             transcript and produce the structured analysis record: summary, \
             intent, urgency, sentiment, whether a reply is needed, \
             actionability, numeric scores, classification tags, tasks, risks, \
             keywords, entities, participants, project tag, message type, \
             reply/forward flags and estimated reading time in seconds.\n\n{}",
            transcript
        ),
        temperature: settings.temperature,
        strict: true,
    };

    let value = client.generate_object(&request).await?;
    let extraction = serde_json::from_value(value)?;
    Ok(extraction)
}
