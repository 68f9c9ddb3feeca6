//! Remote authority wire types

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::locator::Position;

/// Progress as the authority sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProgress {
    /// Furthest position the authority has accepted
    #[serde(rename = "acceptedPosition")]
    pub position: Option<Position>,
    /// Reading time across all devices
    pub total_time_spent_seconds: u64,
}

/// One coalesced push of pending checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointUpload {
    pub position: Position,
    /// Seconds read since the last acknowledged upload
    pub time_spent_delta: u64,
    /// Idempotency keys; ids the authority already applied add no time
    pub checkpoint_ids: Vec<Uuid>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Authority failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or server trouble; try again later
    #[error("Transient: {0}")]
    Transient(String),

    /// The authority refused the request (e.g. access revoked)
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}
