//! One push cycle plus the retry loop around it

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};

use super::{SyncEvent, SyncOutcome};
use crate::authority::{CheckpointUpload, RemoteAuthority, RemoteError};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::locator::order_positions;
use crate::store::{PositionStore, ReadingCheckpoint};

const EVENT_CAPACITY: usize = 64;

/// Merge pending checkpoints into one upload: the furthest position, the sum
/// of the deltas, and every id. Later attributes override earlier ones.
pub fn coalesce(pending: &[ReadingCheckpoint]) -> Option<CheckpointUpload> {
    let furthest = pending
        .iter()
        .map(|c| &c.position)
        .max_by(|a, b| order_positions(a, b))?;

    let mut attributes = serde_json::Map::new();
    for checkpoint in pending {
        attributes.extend(checkpoint.attributes.clone());
    }

    Some(CheckpointUpload {
        position: furthest.clone(),
        time_spent_delta: pending.iter().map(|c| c.time_spent_delta_seconds).sum(),
        checkpoint_ids: pending.iter().map(|c| c.id).collect(),
        attributes,
    })
}

/// Drives pending checkpoints to the authority
pub struct SyncCoordinator {
    store: PositionStore,
    authority: Arc<dyn RemoteAuthority>,
    config: EngineConfig,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    pub fn new(
        store: PositionStore,
        authority: Arc<dyn RemoteAuthority>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            authority,
            config,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    pub fn authority(&self) -> &Arc<dyn RemoteAuthority> {
        &self.authority
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Retry delay after `attempt` consecutive failures
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.backoff_cap)
    }

    fn is_degraded(&self, pending: &[ReadingCheckpoint]) -> bool {
        if pending.len() > self.config.degraded_pending_limit {
            return true;
        }
        let Some(oldest) = pending.iter().map(|c| c.captured_at).min() else {
            return false;
        };
        (Utc::now() - oldest)
            .to_std()
            .map(|age| age > self.config.degraded_pending_age)
            .unwrap_or(false)
    }

    /// Run one push cycle for a book
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn push_pending(&self, user_id: &str, book_id: &str) -> Result<SyncOutcome> {
        let pending = self.store.pending(user_id, book_id).await?;
        let Some(upload) = coalesce(&pending) else {
            return Ok(SyncOutcome::UpToDate);
        };

        match self.authority.push_checkpoint(user_id, book_id, &upload).await {
            Ok(ack) => {
                self.store
                    .mark_synced(user_id, book_id, &upload.checkpoint_ids, &ack)
                    .await?;

                tracing::info!(
                    user_id,
                    book_id,
                    checkpoints = upload.checkpoint_ids.len(),
                    seconds = upload.time_spent_delta,
                    remote_total = ack.total_time_spent_seconds,
                    "synced checkpoints"
                );
                self.emit(SyncEvent::Synced {
                    user_id: user_id.to_string(),
                    book_id: book_id.to_string(),
                    checkpoints: upload.checkpoint_ids.len(),
                    accepted: ack.position.clone(),
                    remote_time_spent_seconds: ack.total_time_spent_seconds,
                });

                Ok(SyncOutcome::Synced {
                    checkpoints: upload.checkpoint_ids.len(),
                    time_spent_seconds: upload.time_spent_delta,
                    accepted: ack.position,
                })
            }
            Err(RemoteError::Transient(error)) => {
                let degraded = self.is_degraded(&pending);
                tracing::warn!(user_id, book_id, pending = pending.len(), "sync deferred: {}", error);

                if degraded {
                    self.emit(SyncEvent::Degraded {
                        user_id: user_id.to_string(),
                        book_id: book_id.to_string(),
                        pending: pending.len(),
                        oldest_pending_at: pending.iter().map(|c| c.captured_at).min(),
                    });
                }

                Ok(SyncOutcome::Deferred { error, degraded })
            }
            Err(RemoteError::Rejected(reason)) => {
                let discarded = self.store.discard_pending(user_id, book_id).await?;
                tracing::warn!(user_id, book_id, discarded, "sync rejected: {}", reason);

                self.emit(SyncEvent::Rejected {
                    user_id: user_id.to_string(),
                    book_id: book_id.to_string(),
                    reason: reason.clone(),
                    discarded,
                });

                Ok(SyncOutcome::Rejected { reason, discarded })
            }
        }
    }

    /// Push until nothing is pending, the authority rejects, or `shutdown`
    /// flips. Transient failures back off exponentially without a limit.
    /// Returns the last outcome.
    pub async fn sync_until_drained(
        &self,
        user_id: &str,
        book_id: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SyncOutcome> {
        let mut attempt = 0u32;
        let mut last = SyncOutcome::UpToDate;

        loop {
            if *shutdown.borrow() {
                return Ok(last);
            }

            let outcome = self.push_pending(user_id, book_id).await?;
            match &outcome {
                SyncOutcome::UpToDate => return Ok(last),
                SyncOutcome::Rejected { .. } => return Ok(outcome),
                SyncOutcome::Synced { .. } => {
                    attempt = 0;
                    last = outcome;
                    // Checkpoints captured while the push was in flight
                    if self.store.pending(user_id, book_id).await?.is_empty() {
                        return Ok(last);
                    }
                }
                SyncOutcome::Deferred { error, .. } => {
                    let delay = self.backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    self.emit(SyncEvent::Deferred {
                        user_id: user_id.to_string(),
                        book_id: book_id.to_string(),
                        error: error.clone(),
                        retry_in: Some(delay),
                    });
                    tracing::debug!(user_id, book_id, attempt, ?delay, "retrying sync");
                    last = outcome;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return Ok(last);
                            }
                        }
                    }
                }
            }
        }
    }
}
