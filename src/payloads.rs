//! Queue payload schemas and the webhook parsing boundary.
//!
//! Everything that crosses a durable queue is parsed here, once, into a typed
//! struct; workers never poke at raw JSON beyond this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Job on `inbox_backfill_jobs`: paginate one configuration's remote thread
/// list over a bounded date window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillJob {
    pub inbox_id: Uuid,
    pub config_id: Uuid,
    pub grant_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

/// Job on `thread_sync_jobs`: fetch and persist one thread with its messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSyncJob {
    pub thread_id: String,
    pub grant_id: String,
    pub inbox_id: Uuid,
    pub config_id: Uuid,
}

/// Push notification relayed onto `webhook_notifications`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookNotification {
    pub notification_id: Uuid,
    #[serde(default)]
    pub webhook_id: Option<String>,
    pub inbox_id: Uuid,
    pub notification_type: String,
    #[serde(default)]
    pub grant_id: String,
    #[serde(default)]
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Job on `extraction_jobs`: run structured extraction for one thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub thread_id: Uuid,
    pub inbox_id: Uuid,
    pub tenant_id: Uuid,
    pub priority: u8,
}

/// Routed webhook notification types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookKind {
    MessageCreated,
    MessageUpdated,
    ThreadReplied,
    GrantExpired,
    Unknown,
}

impl WebhookKind {
    pub fn parse(notification_type: &str) -> Self {
        match notification_type {
            "message.created" => WebhookKind::MessageCreated,
            "message.updated" => WebhookKind::MessageUpdated,
            "thread.replied" => WebhookKind::ThreadReplied,
            "grant.expired" => WebhookKind::GrantExpired,
            _ => WebhookKind::Unknown,
        }
    }
}

/// Dig the remote object id out of a webhook payload.
///
/// Providers have shipped several envelope shapes over time; the probe order
/// is fixed: `data.object.id`, `data.id`, `object.id`, then `id`.
pub fn extract_object_id(payload: &Value) -> Option<&str> {
    payload
        .pointer("/data/object/id")
        .or_else(|| payload.pointer("/data/id"))
        .or_else(|| payload.pointer("/object/id"))
        .or_else(|| payload.pointer("/id"))
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn probes_envelope_shapes_in_order() {
        let nested = json!({"data": {"object": {"id": "msg-1"}}, "id": "outer"});
        assert_eq!(extract_object_id(&nested), Some("msg-1"));

        let data_id = json!({"data": {"id": "msg-2"}});
        assert_eq!(extract_object_id(&data_id), Some("msg-2"));

        let object_id = json!({"object": {"id": "msg-3"}});
        assert_eq!(extract_object_id(&object_id), Some("msg-3"));

        let flat = json!({"id": "msg-4"});
        assert_eq!(extract_object_id(&flat), Some("msg-4"));

        let empty = json!({"data": {}});
        assert_eq!(extract_object_id(&empty), None);
    }

    #[test]
    fn deeper_shapes_win_over_flat_ids() {
        let both = json!({"data": {"id": "inner"}, "id": "outer"});
        assert_eq!(extract_object_id(&both), Some("inner"));
    }

    #[test]
    fn webhook_kinds_route_by_type_string() {
        assert_eq!(
            WebhookKind::parse("message.created"),
            WebhookKind::MessageCreated
        );
        assert_eq!(
            WebhookKind::parse("message.updated"),
            WebhookKind::MessageUpdated
        );
        assert_eq!(WebhookKind::parse("thread.replied"), WebhookKind::ThreadReplied);
        assert_eq!(WebhookKind::parse("grant.expired"), WebhookKind::GrantExpired);
        assert_eq!(WebhookKind::parse("calendar.updated"), WebhookKind::Unknown);
    }

    #[test]
    fn thread_sync_job_round_trips() {
        let job = ThreadSyncJob {
            thread_id: "t-99".to_string(),
            grant_id: "grant-a".to_string(),
            inbox_id: Uuid::new_v4(),
            config_id: Uuid::new_v4(),
        };
        let value = serde_json::to_value(&job).unwrap();
        let back: ThreadSyncJob = serde_json::from_value(value).unwrap();
        assert_eq!(back.thread_id, "t-99");
        assert_eq!(back.grant_id, "grant-a");
    }
}
