//! Position store records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::locator::Position;

/// Why a checkpoint was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointReason {
    Periodic,
    Paused,
    Closing,
    Idle,
}

/// Immutable capture of position plus time read since the previous checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingCheckpoint {
    /// Idempotency key for the remote authority
    pub id: Uuid,
    pub book_id: String,
    pub user_id: String,
    pub position: Position,
    pub time_spent_delta_seconds: u64,
    pub captured_at: DateTime<Utc>,
    pub reason: CheckpointReason,
    /// Telemetry forwarded verbatim
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl ReadingCheckpoint {
    pub fn new(
        user_id: &str,
        book_id: &str,
        position: Position,
        time_spent_delta_seconds: u64,
        captured_at: DateTime<Utc>,
        reason: CheckpointReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            book_id: book_id.to_string(),
            user_id: user_id.to_string(),
            position,
            time_spent_delta_seconds,
            captured_at,
            reason,
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: serde_json::Map<String, serde_json::Value>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Durable progress for one (user, book)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalProgressRecord {
    pub book_id: String,
    pub user_id: String,
    pub position: Option<Position>,
    /// Sum of every checkpoint recorded on this device, plus any seeded total
    pub total_time_spent_seconds: u64,
    /// Last total reported by the authority
    #[serde(default)]
    pub remote_time_spent_seconds: Option<u64>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Unsynced checkpoints in capture order
    #[serde(default)]
    pub pending_checkpoints: Vec<ReadingCheckpoint>,
}

impl LocalProgressRecord {
    pub fn new(user_id: &str, book_id: &str) -> Self {
        Self {
            book_id: book_id.to_string(),
            user_id: user_id.to_string(),
            position: None,
            total_time_spent_seconds: 0,
            remote_time_spent_seconds: None,
            last_synced_at: None,
            pending_checkpoints: Vec::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_checkpoints.is_empty()
    }

    /// Capture time of the oldest unsynced checkpoint
    pub fn oldest_pending_at(&self) -> Option<DateTime<Utc>> {
        self.pending_checkpoints.iter().map(|c| c.captured_at).min()
    }
}

/// Store key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgressKey {
    pub user_id: String,
    pub book_id: String,
}

impl ProgressKey {
    pub fn new(user_id: &str, book_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            book_id: book_id.to_string(),
        }
    }
}

impl std::fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.book_id)
    }
}
