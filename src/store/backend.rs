//! Storage backends for progress records
//!
//! Records are kept as one JSON document per (user, book). The store decodes
//! them, so a backend never needs to know the record layout.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use super::types::ProgressKey;
use super::StoreError;

/// Durable key-value storage for encoded progress records
#[async_trait]
pub trait ProgressBackend: Send + Sync {
    /// Encoded record for a key
    async fn get(&self, key: &ProgressKey) -> Result<Option<String>, StoreError>;

    /// Replace the record for a key. Durable once this returns.
    async fn put(&self, key: &ProgressKey, record_json: &str) -> Result<(), StoreError>;

    /// Delete the record for a key
    async fn delete(&self, key: &ProgressKey) -> Result<bool, StoreError>;

    /// Delete every record of a user
    async fn delete_user(&self, user_id: &str) -> Result<u64, StoreError>;

    /// All records of a user
    async fn list_user(&self, user_id: &str) -> Result<Vec<(ProgressKey, String)>, StoreError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reading_progress_records (
    user_id TEXT NOT NULL,
    book_id TEXT NOT NULL,
    record_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, book_id)
);

CREATE INDEX IF NOT EXISTS idx_progress_records_user ON reading_progress_records(user_id);
"#;

/// SQLite backend. Every write is its own committed transaction.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (or create) the database at `database_url`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Use an existing pool, creating the schema if needed
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        tracing::debug!("progress schema ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ProgressBackend for SqliteBackend {
    async fn get(&self, key: &ProgressKey) -> Result<Option<String>, StoreError> {
        let record = sqlx::query_scalar::<_, String>(
            r#"
            SELECT record_json
            FROM reading_progress_records
            WHERE user_id = ? AND book_id = ?
            "#,
        )
        .bind(&key.user_id)
        .bind(&key.book_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn put(&self, key: &ProgressKey, record_json: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO reading_progress_records (user_id, book_id, record_json, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, book_id) DO UPDATE SET
                record_json = excluded.record_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key.user_id)
        .bind(&key.book_id)
        .bind(record_json)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, key: &ProgressKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM reading_progress_records
            WHERE user_id = ? AND book_id = ?
            "#,
        )
        .bind(&key.user_id)
        .bind(&key.book_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_user(&self, user_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM reading_progress_records WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn list_user(&self, user_id: &str) -> Result<Vec<(ProgressKey, String)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT book_id, record_json
            FROM reading_progress_records
            WHERE user_id = ?
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(book_id, json)| (ProgressKey::new(user_id, &book_id), json))
            .collect())
    }
}

/// In-memory backend for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<ProgressKey, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressBackend for MemoryBackend {
    async fn get(&self, key: &ProgressKey) -> Result<Option<String>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, key: &ProgressKey, record_json: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(key.clone(), record_json.to_string());
        Ok(())
    }

    async fn delete(&self, key: &ProgressKey) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn delete_user(&self, user_id: &str) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|key, _| key.user_id != user_id);
        Ok((before - records.len()) as u64)
    }

    async fn list_user(&self, user_id: &str) -> Result<Vec<(ProgressKey, String)>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .map(|(key, json)| (key.clone(), json.clone()))
            .collect())
    }
}
