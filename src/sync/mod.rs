//! Sync coordinator
//!
//! Pushes pending checkpoints to the remote authority and reconciles the
//! reply into the position store.
//!
//! Rules:
//! - Furthest position wins
//! - Time deltas are additive; checkpoint ids make replays harmless
//! - Nothing leaves the store until the authority acknowledged it
//! - Transient failures retry with exponential backoff, forever
//! - A rejection discards that book's pending checkpoints

mod coordinator;
mod worker;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use coordinator::{coalesce, SyncCoordinator};
pub use worker::{SyncHandle, SyncWorker};

use crate::error::{EngineError, Result};
use crate::locator::Position;

/// Result of one push cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SyncOutcome {
    /// Nothing pending
    UpToDate,
    /// The authority acknowledged the upload
    Synced {
        checkpoints: usize,
        time_spent_seconds: u64,
        accepted: Option<Position>,
    },
    /// Transient failure; checkpoints stay pending
    Deferred { error: String, degraded: bool },
    /// The authority refused; pending checkpoints were dropped
    Rejected { reason: String, discarded: usize },
}

impl SyncOutcome {
    /// Surface the outcome to a caller. A rejection is always an error; a
    /// deferral only once the backlog counts as degraded.
    pub fn into_result(self) -> Result<SyncOutcome> {
        match self {
            SyncOutcome::Rejected { reason, .. } => Err(EngineError::SyncRejected(reason)),
            SyncOutcome::Deferred {
                error,
                degraded: true,
            } => Err(EngineError::SyncTransient(error)),
            outcome => Ok(outcome),
        }
    }
}

/// What prompts a sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    /// A checkpoint was recorded (debounced)
    CheckpointCaptured { user_id: String, book_id: String },
    SessionClosed { user_id: String, book_id: String },
    /// Connectivity came back; drains every book with pending checkpoints
    Reconnected { user_id: String },
    /// The app returned to the foreground
    Foregrounded { user_id: String },
}

/// Broadcast to sessions and other observers
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Synced {
        user_id: String,
        book_id: String,
        checkpoints: usize,
        accepted: Option<Position>,
        remote_time_spent_seconds: u64,
    },
    Deferred {
        user_id: String,
        book_id: String,
        error: String,
        retry_in: Option<Duration>,
    },
    /// Sync has been failing long enough that someone should know
    Degraded {
        user_id: String,
        book_id: String,
        pending: usize,
        oldest_pending_at: Option<DateTime<Utc>>,
    },
    Rejected {
        user_id: String,
        book_id: String,
        reason: String,
        discarded: usize,
    },
}

impl SyncEvent {
    pub fn book_id(&self) -> &str {
        match self {
            SyncEvent::Synced { book_id, .. }
            | SyncEvent::Deferred { book_id, .. }
            | SyncEvent::Degraded { book_id, .. }
            | SyncEvent::Rejected { book_id, .. } => book_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            SyncEvent::Synced { user_id, .. }
            | SyncEvent::Deferred { user_id, .. }
            | SyncEvent::Degraded { user_id, .. }
            | SyncEvent::Rejected { user_id, .. } => user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_surfacing() {
        assert_eq!(SyncOutcome::UpToDate.into_result().unwrap(), SyncOutcome::UpToDate);

        let quiet = SyncOutcome::Deferred {
            error: "timeout".to_string(),
            degraded: false,
        };
        assert_eq!(quiet.clone().into_result().unwrap(), quiet);

        let degraded = SyncOutcome::Deferred {
            error: "timeout".to_string(),
            degraded: true,
        };
        let err = degraded.into_result().unwrap_err();
        assert!(matches!(&err, EngineError::SyncTransient(e) if e == "timeout"));
        assert!(err.is_recoverable());

        let rejected = SyncOutcome::Rejected {
            reason: "access revoked".to_string(),
            discarded: 2,
        };
        let err = rejected.into_result().unwrap_err();
        assert!(matches!(&err, EngineError::SyncRejected(r) if r == "access revoked"));
        assert!(!err.is_recoverable());
    }
}
