//! Status enums, progress rows and the backfill checkpoint blob.
//!
//! Statuses are stored as text columns; the enums here are the single place
//! that knows the wire spelling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a sync configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStatus {
    Idle,
    Backfill,
    ThreadSync,
    Completed,
    Failed,
}

impl ConfigStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigStatus::Idle => "idle",
            ConfigStatus::Backfill => "backfill",
            ConfigStatus::ThreadSync => "thread_sync",
            ConfigStatus::Completed => "completed",
            ConfigStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(ConfigStatus::Idle),
            "backfill" => Some(ConfigStatus::Backfill),
            "thread_sync" => Some(ConfigStatus::ThreadSync),
            "completed" => Some(ConfigStatus::Completed),
            "failed" => Some(ConfigStatus::Failed),
            _ => None,
        }
    }
}

/// Lifecycle of a per-thread work row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Queued => "queued",
            WorkStatus::Processing => "processing",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(WorkStatus::Queued),
            "processing" => Some(WorkStatus::Processing),
            "completed" => Some(WorkStatus::Completed),
            "failed" => Some(WorkStatus::Failed),
            _ => None,
        }
    }
}

/// Tracking states on the extraction queue table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionState {
    Queued,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl ExtractionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionState::Queued => "queued",
            ExtractionState::Processing => "processing",
            ExtractionState::Retrying => "retrying",
            ExtractionState::Completed => "completed",
            ExtractionState::Failed => "failed",
        }
    }
}

/// Resumption state for a backfill, persisted on the configuration row after
/// every page. `current_page` only moves forward for a given configuration
/// until the checkpoint is cleared on completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackfillCheckpoint {
    pub last_page_token: Option<String>,
    pub threads_queued: u32,
    pub current_page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A per-thread work row as read back from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ThreadWorkRow {
    pub id: i64,
    pub config_id: Uuid,
    pub remote_thread_id: String,
    pub grant_id: String,
    pub status: String,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub messages_synced: i32,
    pub error: Option<String>,
}

/// The per-configuration counter row used for progress reporting.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncStatsRow {
    pub config_id: Uuid,
    pub threads_total: i32,
    pub threads_queued: i32,
    pub threads_processing: i32,
    pub threads_completed: i32,
    pub threads_failed: i32,
    pub messages_synced: i32,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub last_thread_at: Option<DateTime<Utc>>,
    pub sync_completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_spellings_round_trip() {
        for status in [
            ConfigStatus::Idle,
            ConfigStatus::Backfill,
            ConfigStatus::ThreadSync,
            ConfigStatus::Completed,
            ConfigStatus::Failed,
        ] {
            assert_eq!(ConfigStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ConfigStatus::parse("bogus"), None);

        for status in [
            WorkStatus::Queued,
            WorkStatus::Processing,
            WorkStatus::Completed,
            WorkStatus::Failed,
        ] {
            assert_eq!(WorkStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn checkpoint_serializes_without_error_field_when_clean() {
        let checkpoint = BackfillCheckpoint {
            last_page_token: Some("tok".to_string()),
            threads_queued: 12,
            current_page: 3,
            error: None,
        };
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["current_page"], 3);

        let restored: BackfillCheckpoint = serde_json::from_value(json).unwrap();
        assert_eq!(restored.last_page_token.as_deref(), Some("tok"));
        assert_eq!(restored.threads_queued, 12);
    }
}
