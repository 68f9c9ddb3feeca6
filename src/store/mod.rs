//! Position store
//!
//! Durable per-(user, book) progress: the furthest position read, total time
//! spent, and checkpoints not yet acknowledged by the authority. Every
//! mutation is a read-modify-write under a per-key lock and is committed by
//! the backend before the call returns.

mod backend;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub use backend::{MemoryBackend, ProgressBackend, SqliteBackend};
pub use types::{CheckpointReason, LocalProgressRecord, ProgressKey, ReadingCheckpoint};

use crate::authority::RemoteProgress;
use crate::locator::{order_positions, Position};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

struct StoreInner {
    backend: Arc<dyn ProgressBackend>,
    locks: Mutex<HashMap<ProgressKey, Arc<Mutex<()>>>>,
}

/// Shared handle to the progress records
#[derive(Clone)]
pub struct PositionStore {
    inner: Arc<StoreInner>,
}

fn is_after(candidate: &Position, current: Option<&Position>) -> bool {
    match current {
        Some(current) => order_positions(candidate, current).is_gt(),
        None => true,
    }
}

impl PositionStore {
    pub fn new(backend: Arc<dyn ProgressBackend>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Store backed by memory only
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    async fn key_lock(&self, key: &ProgressKey) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.lock().await;
        // A lock only the map holds has no operation in flight
        locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        locks.entry(key.clone()).or_default().clone()
    }

    /// Decode a stored record; an undecodable record reads as absent
    async fn read(&self, key: &ProgressKey) -> StoreResult<Option<LocalProgressRecord>> {
        let Some(json) = self.inner.backend.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&json) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(key = %key, "discarding corrupt progress record: {}", e);
                Ok(None)
            }
        }
    }

    async fn write(&self, key: &ProgressKey, record: &LocalProgressRecord) -> StoreResult<()> {
        let json = serde_json::to_string(record)?;
        self.inner.backend.put(key, &json).await
    }

    /// Read-modify-write one record under its key lock
    async fn update<T>(
        &self,
        key: ProgressKey,
        f: impl FnOnce(&mut LocalProgressRecord) -> T,
    ) -> StoreResult<(LocalProgressRecord, T)> {
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let mut record = self
            .read(&key)
            .await?
            .unwrap_or_else(|| LocalProgressRecord::new(&key.user_id, &key.book_id));
        let out = f(&mut record);
        self.write(&key, &record).await?;

        Ok((record, out))
    }

    pub async fn load(&self, user_id: &str, book_id: &str) -> StoreResult<Option<LocalProgressRecord>> {
        self.read(&ProgressKey::new(user_id, book_id)).await
    }

    /// Append a checkpoint. Time always accumulates; the position only moves
    /// forward.
    pub async fn record_checkpoint(
        &self,
        checkpoint: ReadingCheckpoint,
    ) -> StoreResult<LocalProgressRecord> {
        let key = ProgressKey::new(&checkpoint.user_id, &checkpoint.book_id);
        let (record, advanced) = self
            .update(key, |record| {
                record.total_time_spent_seconds += checkpoint.time_spent_delta_seconds;
                let advanced = is_after(&checkpoint.position, record.position.as_ref());
                if advanced {
                    record.position = Some(checkpoint.position.clone());
                }
                record.pending_checkpoints.push(checkpoint);
                advanced
            })
            .await?;

        tracing::debug!(
            user_id = %record.user_id,
            book_id = %record.book_id,
            advanced,
            total_seconds = record.total_time_spent_seconds,
            pending = record.pending_checkpoints.len(),
            "recorded checkpoint"
        );
        Ok(record)
    }

    /// Pending checkpoints in capture order
    pub async fn pending(&self, user_id: &str, book_id: &str) -> StoreResult<Vec<ReadingCheckpoint>> {
        Ok(self
            .load(user_id, book_id)
            .await?
            .map(|r| r.pending_checkpoints)
            .unwrap_or_default())
    }

    /// Drop acknowledged checkpoints and reconcile with the authority's reply.
    /// The furthest position wins; local time is never replaced.
    pub async fn mark_synced(
        &self,
        user_id: &str,
        book_id: &str,
        checkpoint_ids: &[Uuid],
        ack: &RemoteProgress,
    ) -> StoreResult<LocalProgressRecord> {
        let key = ProgressKey::new(user_id, book_id);
        let (record, _) = self
            .update(key, |record| {
                record
                    .pending_checkpoints
                    .retain(|c| !checkpoint_ids.contains(&c.id));

                if let Some(remote) = &ack.position {
                    if is_after(remote, record.position.as_ref()) {
                        record.position = Some(remote.clone());
                    }
                }

                record.remote_time_spent_seconds = Some(ack.total_time_spent_seconds);
                record.last_synced_at = Some(Utc::now());
            })
            .await?;

        Ok(record)
    }

    /// Create a record from the authority's progress when none exists locally.
    /// An existing record is returned untouched.
    pub async fn seed_from_remote(
        &self,
        user_id: &str,
        book_id: &str,
        remote: &RemoteProgress,
    ) -> StoreResult<LocalProgressRecord> {
        let key = ProgressKey::new(user_id, book_id);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.read(&key).await? {
            return Ok(existing);
        }

        let mut record = LocalProgressRecord::new(user_id, book_id);
        record.position = remote.position.clone();
        record.total_time_spent_seconds = remote.total_time_spent_seconds;
        record.remote_time_spent_seconds = Some(remote.total_time_spent_seconds);
        record.last_synced_at = Some(Utc::now());
        self.write(&key, &record).await?;

        tracing::info!(user_id, book_id, "seeded progress from authority");
        Ok(record)
    }

    /// Drop every pending checkpoint of a book. Returns how many were dropped.
    pub async fn discard_pending(&self, user_id: &str, book_id: &str) -> StoreResult<usize> {
        let key = ProgressKey::new(user_id, book_id);
        let (_, discarded) = self
            .update(key, |record| {
                let discarded = record.pending_checkpoints.len();
                record.pending_checkpoints.clear();
                discarded
            })
            .await?;

        if discarded > 0 {
            tracing::warn!(user_id, book_id, discarded, "discarded pending checkpoints");
        }
        Ok(discarded)
    }

    /// Books of a user with unsynced checkpoints
    pub async fn books_with_pending(&self, user_id: &str) -> StoreResult<Vec<String>> {
        let records = self.inner.backend.list_user(user_id).await?;
        Ok(records
            .into_iter()
            .filter_map(|(key, json)| {
                serde_json::from_str::<LocalProgressRecord>(&json)
                    .ok()
                    .filter(|r| r.has_pending())
                    .map(|_| key.book_id)
            })
            .collect())
    }

    /// Forget one book's progress
    pub async fn reset(&self, user_id: &str, book_id: &str) -> StoreResult<bool> {
        let key = ProgressKey::new(user_id, book_id);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;
        self.inner.backend.delete(&key).await
    }

    /// Forget everything stored for a user (sign-out)
    pub async fn clear_user(&self, user_id: &str) -> StoreResult<u64> {
        let removed = self.inner.backend.delete_user(user_id).await?;
        self.inner
            .locks
            .lock()
            .await
            .retain(|key, _| key.user_id != user_id);
        tracing::info!(user_id, removed, "cleared user progress");
        Ok(removed)
    }
}
