//! Reference progress authority
//!
//! A small axum service holding progress in memory. It applies the same rules
//! a production authority must: the furthest position wins, time deltas add
//! up, and checkpoint ids already applied never add time twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::types::{CheckpointUpload, RemoteProgress};
use crate::locator::order_positions;

#[derive(Error, Debug)]
pub enum AuthorityError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AuthorityError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            AuthorityError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AuthorityError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            AuthorityError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default)]
struct LedgerEntry {
    progress: Option<RemoteProgress>,
    /// Seconds credited per applied checkpoint id
    credited: HashMap<Uuid, u64>,
}

#[derive(Default)]
struct LedgerInner {
    entries: HashMap<(String, String), LedgerEntry>,
    revoked: HashSet<(String, String)>,
}

/// Canonical progress per (user, book)
#[derive(Clone, Default)]
pub struct ProgressLedger {
    inner: Arc<RwLock<LedgerInner>>,
}

impl ProgressLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user_id: &str, book_id: &str) -> Result<RemoteProgress, AuthorityError> {
        let key = (user_id.to_string(), book_id.to_string());
        let inner = self.inner.read().await;
        if inner.revoked.contains(&key) {
            return Err(AuthorityError::Forbidden(format!("access to {} revoked", book_id)));
        }
        inner
            .entries
            .get(&key)
            .and_then(|e| e.progress.clone())
            .ok_or_else(|| AuthorityError::NotFound(format!("No progress for book: {}", book_id)))
    }

    /// Apply an upload. Ids seen before are subtracted from the delta: a
    /// retried upload always carries every id of the upload it retries.
    pub async fn apply(
        &self,
        user_id: &str,
        book_id: &str,
        upload: &CheckpointUpload,
    ) -> Result<RemoteProgress, AuthorityError> {
        if !upload.position.fraction.is_finite() || !(0.0..=1.0).contains(&upload.position.fraction)
        {
            return Err(AuthorityError::BadRequest(format!(
                "fraction out of range: {}",
                upload.position.fraction
            )));
        }

        let key = (user_id.to_string(), book_id.to_string());
        let mut inner = self.inner.write().await;
        if inner.revoked.contains(&key) {
            return Err(AuthorityError::Forbidden(format!("access to {} revoked", book_id)));
        }

        let entry = inner.entries.entry(key).or_default();

        let fresh: Vec<Uuid> = upload
            .checkpoint_ids
            .iter()
            .filter(|id| !entry.credited.contains_key(id))
            .copied()
            .collect();
        let already: u64 = upload
            .checkpoint_ids
            .iter()
            .filter_map(|id| entry.credited.get(id))
            .sum();
        let delta = if fresh.is_empty() {
            0
        } else {
            upload.time_spent_delta.saturating_sub(already)
        };

        for (i, id) in fresh.iter().enumerate() {
            entry.credited.insert(*id, if i == 0 { delta } else { 0 });
        }

        let mut progress = entry.progress.take().unwrap_or(RemoteProgress {
            position: None,
            total_time_spent_seconds: 0,
        });
        progress.total_time_spent_seconds += delta;

        let advances = match &progress.position {
            Some(current) => order_positions(&upload.position, current).is_gt(),
            None => true,
        };
        if advances {
            progress.position = Some(upload.position.clone());
        }

        tracing::debug!(
            user_id,
            book_id,
            applied = fresh.len(),
            delta,
            total = progress.total_time_spent_seconds,
            advanced = advances,
            "applied checkpoint upload"
        );

        entry.progress = Some(progress.clone());
        Ok(progress)
    }

    /// Refuse further access to a book for a user
    pub async fn revoke(&self, user_id: &str, book_id: &str) {
        self.inner
            .write()
            .await
            .revoked
            .insert((user_id.to_string(), book_id.to_string()));
    }
}

/// Create the authority router
pub fn router(ledger: ProgressLedger) -> Router {
    Router::new()
        .route("/api/v1/progress/:user_id/:book_id", get(get_progress))
        .route(
            "/api/v1/progress/:user_id/:book_id/checkpoints",
            post(push_checkpoint),
        )
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(ledger)
}

async fn health() -> &'static str {
    "OK"
}

async fn get_progress(
    State(ledger): State<ProgressLedger>,
    Path((user_id, book_id)): Path<(String, String)>,
) -> Result<Json<RemoteProgress>, AuthorityError> {
    ledger.get(&user_id, &book_id).await.map(Json)
}

async fn push_checkpoint(
    State(ledger): State<ProgressLedger>,
    Path((user_id, book_id)): Path<(String, String)>,
    Json(upload): Json<CheckpointUpload>,
) -> Result<Json<RemoteProgress>, AuthorityError> {
    ledger.apply(&user_id, &book_id, &upload).await.map(Json)
}
